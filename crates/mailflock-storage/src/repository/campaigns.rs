//! Campaign repository

use crate::db::{db_error, DatabasePool};
use crate::models::{Campaign, CampaignStatus, CreateCampaign, DispatchProgress, UpdateCampaign};
use crate::pagination::{Pagination, PaginationCursor, Resource};
use async_trait::async_trait;
use chrono::Utc;
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::{Error, Result};
use sqlx::types::Json;
use tracing::{debug, info};

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// New campaigns start as drafts. Names are unique per user.
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;

    async fn get(&self, user_id: UserId, id: CampaignId) -> Result<Option<Campaign>>;

    async fn get_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Campaign>>;

    async fn list(&self, user_id: UserId, cursor: &PaginationCursor)
        -> Result<Pagination<Campaign>>;

    async fn list_by_template_name(
        &self,
        user_id: UserId,
        template_name: &str,
    ) -> Result<Vec<Campaign>>;

    /// Edit name and template. Campaigns that are sending or sent are `InvalidState`.
    async fn update(
        &self,
        user_id: UserId,
        id: CampaignId,
        input: UpdateCampaign,
    ) -> Result<Campaign>;

    /// Missing campaigns are `NotFound`
    async fn delete(&self, user_id: UserId, id: CampaignId) -> Result<()>;

    async fn total(&self, user_id: UserId) -> Result<i64>;

    /// Move a campaign to `next` if its current status allows it.
    ///
    /// Moving to `sent` stamps `completed_at`. Leaving `sending` clears the
    /// dispatch progress. A missing campaign is `NotFound`; a disallowed move
    /// is `InvalidState`.
    async fn transition_status(
        &self,
        user_id: UserId,
        id: CampaignId,
        next: CampaignStatus,
    ) -> Result<Campaign>;

    /// Record how far the dispatch of a `sending` campaign got
    async fn save_dispatch_progress(
        &self,
        user_id: UserId,
        id: CampaignId,
        progress: &DispatchProgress,
    ) -> Result<()>;
}

/// Explain why a guarded transition matched no row
pub(crate) fn rejected_transition(
    id: CampaignId,
    current: Option<&Campaign>,
    next: CampaignStatus,
) -> Error {
    match current {
        None => Error::NotFound(format!("Campaign {} not found", id)),
        Some(c) => Error::InvalidState(format!(
            "Campaign {} cannot move from {} to {}",
            id, c.status, next
        )),
    }
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn name_conflict(name: &str) -> impl Fn(sqlx::Error) -> Error + '_ {
    move |e| match db_error(e) {
        Error::Conflict(_) => Error::Conflict(format!("Campaign {} already exists", name)),
        other => other,
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (user_id, name, template_name, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.template_name)
        .bind(CampaignStatus::Draft.as_str())
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(name_conflict(&input.name))?;

        debug!(user_id = input.user_id, campaign_id = campaign.id, "Created campaign");
        Ok(campaign)
    }

    async fn get(&self, user_id: UserId, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn get_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE user_id = $1 AND name = $2")
            .bind(user_id)
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn list(
        &self,
        user_id: UserId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Campaign>> {
        let mut cursor = cursor.clone();
        cursor.resource = Resource::Campaigns;
        super::fetch_page(self.pool.pool(), &cursor, user_id).await
    }

    async fn list_by_template_name(
        &self,
        user_id: UserId,
        template_name: &str,
    ) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE user_id = $1 AND template_name = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1000
            "#,
        )
        .bind(user_id)
        .bind(template_name)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn update(
        &self,
        user_id: UserId,
        id: CampaignId,
        input: UpdateCampaign,
    ) -> Result<Campaign> {
        let updated = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns
            SET name = $3, template_name = $4, updated_at = $5
            WHERE user_id = $1 AND id = $2 AND status IN ('draft', 'scheduled')
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(&input.name)
        .bind(&input.template_name)
        .bind(Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(name_conflict(&input.name))?;

        match updated {
            Some(campaign) => Ok(campaign),
            None => match self.get(user_id, id).await? {
                None => Err(Error::NotFound(format!("Campaign {} not found", id))),
                Some(c) => Err(Error::InvalidState(format!(
                    "Campaign {} is {} and can no longer be edited",
                    id, c.status
                ))),
            },
        }
    }

    async fn delete(&self, user_id: UserId, id: CampaignId) -> Result<()> {
        let removed = sqlx::query("DELETE FROM campaigns WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?
            .rows_affected();

        if removed == 0 {
            return Err(Error::NotFound(format!("Campaign {} not found", id)));
        }
        debug!(user_id, campaign_id = id, "Deleted campaign");
        Ok(())
    }

    async fn total(&self, user_id: UserId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM campaigns WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn transition_status(
        &self,
        user_id: UserId,
        id: CampaignId,
        next: CampaignStatus,
    ) -> Result<Campaign> {
        let allowed: Vec<String> = next
            .allowed_from()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let updated = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns
            SET status = $3,
                completed_at = CASE WHEN $3 = 'sent' THEN $5 ELSE completed_at END,
                dispatch_progress = CASE WHEN $3 = 'sending' THEN dispatch_progress ELSE NULL END,
                updated_at = $5
            WHERE user_id = $1 AND id = $2 AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(next.as_str())
        .bind(allowed)
        .bind(Utc::now())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)?;

        match updated {
            Some(campaign) => {
                info!(user_id, campaign_id = id, status = %next, "Campaign status changed");
                Ok(campaign)
            }
            None => {
                let current = self.get(user_id, id).await?;
                Err(rejected_transition(id, current.as_ref(), next))
            }
        }
    }

    async fn save_dispatch_progress(
        &self,
        user_id: UserId,
        id: CampaignId,
        progress: &DispatchProgress,
    ) -> Result<()> {
        let saved = sqlx::query(
            r#"
            UPDATE campaigns
            SET dispatch_progress = $3, updated_at = $4
            WHERE user_id = $1 AND id = $2 AND status = 'sending'
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(Json(progress))
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?
        .rows_affected();

        if saved == 0 {
            let current = self.get(user_id, id).await?;
            return Err(rejected_transition(id, current.as_ref(), CampaignStatus::Sending));
        }
        Ok(())
    }
}
