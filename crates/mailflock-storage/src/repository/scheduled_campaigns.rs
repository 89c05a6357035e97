//! Scheduled campaign repository
//!
//! A schedule is a timer row keyed by campaign id, kept apart from the
//! campaign itself. Writing a schedule and moving the campaign to
//! `scheduled` happen in one transaction, as do removing it and moving the
//! campaign back to `draft`.
//!
//! Pollers claim due schedules with a lease instead of removing them. The
//! row is deleted only once its campaign message is out, so a poller that
//! dies or fails mid-way leaves the schedule to be claimed again when the
//! lease runs out.

use crate::db::{db_error, DatabasePool};
use crate::models::{Campaign, CampaignStatus, ScheduleCampaign, ScheduledCampaign};
use crate::repository::campaigns::rejected_transition;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::{Error, Result};
use sqlx::types::Json;
use tracing::{debug, info};
use uuid::Uuid;

/// Scheduled campaign repository trait
#[async_trait]
pub trait ScheduledCampaignRepository: Send + Sync {
    /// Create or replace the schedule of a `draft` or `scheduled` campaign
    async fn upsert(&self, input: ScheduleCampaign) -> Result<ScheduledCampaign>;

    async fn get(&self, user_id: UserId, campaign_id: CampaignId)
        -> Result<Option<ScheduledCampaign>>;

    /// Remove the schedule and return the campaign to `draft`
    async fn delete(&self, user_id: UserId, campaign_id: CampaignId) -> Result<()>;

    /// Atomically claim up to `limit` unclaimed schedules due at `now`, across
    /// all users. Claimed rows stay hidden from other claims for `lease`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ScheduledCampaign>>;

    /// Remove a claimed schedule once it has fired. Returns false when the
    /// claim was lost to a newer upsert or another poller.
    async fn complete_claim(&self, claimed: &ScheduledCampaign) -> Result<bool>;

    /// Give a claimed schedule back so the next poll retries it
    async fn release_claim(&self, claimed: &ScheduledCampaign) -> Result<bool>;
}

/// Database scheduled campaign repository
pub struct DbScheduledCampaignRepository {
    pool: DatabasePool,
}

impl DbScheduledCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledCampaignRepository for DbScheduledCampaignRepository {
    async fn upsert(&self, input: ScheduleCampaign) -> Result<ScheduledCampaign> {
        let now = Utc::now();
        let allowed: Vec<String> = CampaignStatus::Scheduled
            .allowed_from()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns
            SET status = 'scheduled', scheduled_at = $3, updated_at = $4
            WHERE user_id = $1 AND id = $2 AND status = ANY($5)
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(input.campaign_id)
        .bind(input.scheduled_at)
        .bind(now)
        .bind(allowed)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        if campaign.is_none() {
            tx.rollback().await.map_err(db_error)?;
            let current = sqlx::query_as::<_, Campaign>(
                "SELECT * FROM campaigns WHERE user_id = $1 AND id = $2",
            )
            .bind(input.user_id)
            .bind(input.campaign_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;
            return Err(rejected_transition(
                input.campaign_id,
                current.as_ref(),
                CampaignStatus::Scheduled,
            ));
        }

        let scheduled = sqlx::query_as::<_, ScheduledCampaign>(
            r#"
            INSERT INTO scheduled_campaigns
                (id, campaign_id, user_id, user_uuid, scheduled_at, source, segment_ids, template_data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (campaign_id) DO UPDATE SET
                user_uuid = EXCLUDED.user_uuid,
                scheduled_at = EXCLUDED.scheduled_at,
                source = EXCLUDED.source,
                segment_ids = EXCLUDED.segment_ids,
                template_data = EXCLUDED.template_data,
                claimed_until = NULL,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.campaign_id)
        .bind(input.user_id)
        .bind(&input.user_uuid)
        .bind(input.scheduled_at)
        .bind(&input.source)
        .bind(Json(&input.segment_ids))
        .bind(Json(&input.template_data))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        info!(
            user_id = input.user_id,
            campaign_id = input.campaign_id,
            scheduled_at = %input.scheduled_at,
            "Campaign scheduled"
        );
        Ok(scheduled)
    }

    async fn get(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
    ) -> Result<Option<ScheduledCampaign>> {
        sqlx::query_as::<_, ScheduledCampaign>(
            "SELECT * FROM scheduled_campaigns WHERE user_id = $1 AND campaign_id = $2",
        )
        .bind(user_id)
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn delete(&self, user_id: UserId, campaign_id: CampaignId) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        let removed = sqlx::query(
            "DELETE FROM scheduled_campaigns WHERE user_id = $1 AND campaign_id = $2",
        )
        .bind(user_id)
        .bind(campaign_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        if removed == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(Error::NotFound(format!(
                "Campaign {} has no schedule",
                campaign_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'draft', scheduled_at = NULL, updated_at = $3
            WHERE user_id = $1 AND id = $2 AND status = 'scheduled'
            "#,
        )
        .bind(user_id)
        .bind(campaign_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(user_id, campaign_id, "Campaign unscheduled");
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ScheduledCampaign>> {
        sqlx::query_as::<_, ScheduledCampaign>(
            r#"
            UPDATE scheduled_campaigns
            SET claimed_until = $2
            WHERE id IN (
                SELECT id FROM scheduled_campaigns
                WHERE scheduled_at <= $1
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY scheduled_at ASC, campaign_id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn complete_claim(&self, claimed: &ScheduledCampaign) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM scheduled_campaigns WHERE id = $1 AND claimed_until = $2",
        )
        .bind(claimed.id)
        .bind(claimed.claimed_until)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?
        .rows_affected();

        Ok(removed > 0)
    }

    async fn release_claim(&self, claimed: &ScheduledCampaign) -> Result<bool> {
        let released = sqlx::query(
            r#"
            UPDATE scheduled_campaigns
            SET claimed_until = NULL
            WHERE id = $1 AND claimed_until = $2
            "#,
        )
        .bind(claimed.id)
        .bind(claimed.claimed_until)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?
        .rows_affected();

        Ok(released > 0)
    }
}
