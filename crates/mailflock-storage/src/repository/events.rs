//! Campaign event read side

use crate::db::{db_error, DatabasePool};
use crate::models::{
    Bounce, CampaignStats, Click, ClicksStats, Complaint, Delivery, Open, OpensStats,
};
use crate::pagination::{Pageable, Pagination, PaginationCursor, Resource, Scope};
use async_trait::async_trait;
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::Result;
use sqlx::postgres::PgRow;
use sqlx::FromRow;

/// Read access to the events recorded for a campaign
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn opens(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Open>>;

    async fn clicks(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Click>>;

    async fn bounces(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Bounce>>;

    async fn complaints(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Complaint>>;

    async fn deliveries(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Delivery>>;

    async fn opens_stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<OpensStats>;

    async fn clicks_stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<ClicksStats>;

    async fn total_sent(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64>;

    async fn total_delivered(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64>;

    async fn total_bounces(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64>;

    async fn total_complaints(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64>;

    /// All counters for a campaign
    async fn stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<CampaignStats> {
        Ok(CampaignStats {
            opens: self.opens_stats(user_id, campaign_id).await?,
            clicks: self.clicks_stats(user_id, campaign_id).await?,
            total_sent: self.total_sent(user_id, campaign_id).await?,
            delivered: self.total_delivered(user_id, campaign_id).await?,
            bounces: self.total_bounces(user_id, campaign_id).await?,
            complaints: self.total_complaints(user_id, campaign_id).await?,
        })
    }
}

/// Narrow a caller cursor to one campaign's rows of `resource`
pub(crate) fn campaign_cursor(
    cursor: &PaginationCursor,
    resource: Resource,
    campaign_id: CampaignId,
) -> PaginationCursor {
    let mut cursor = cursor.clone().with_scope(Scope::ForCampaign(campaign_id));
    cursor.resource = resource;
    cursor
}

/// Database event repository
pub struct DbEventRepository {
    pool: DatabasePool,
}

impl DbEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn page<T>(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
        resource: Resource,
    ) -> Result<Pagination<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Pageable + Send + Unpin,
    {
        let cursor = campaign_cursor(cursor, resource, campaign_id);
        super::fetch_page(self.pool.pool(), &cursor, user_id).await
    }

    async fn count(&self, table: &str, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE user_id = $1 AND campaign_id = $2",
            table
        ))
        .bind(user_id)
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    /// `(unique recipients, total rows)` for an event table
    async fn unique_and_total(
        &self,
        table: &str,
        user_id: UserId,
        campaign_id: CampaignId,
    ) -> Result<(i64, i64)> {
        sqlx::query_as::<_, (i64, i64)>(&format!(
            "SELECT COUNT(DISTINCT recipient), COUNT(recipient) FROM {} \
             WHERE user_id = $1 AND campaign_id = $2",
            table
        ))
        .bind(user_id)
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }
}

#[async_trait]
impl EventRepository for DbEventRepository {
    async fn opens(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Open>> {
        self.page(user_id, campaign_id, cursor, Resource::Opens).await
    }

    async fn clicks(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Click>> {
        self.page(user_id, campaign_id, cursor, Resource::Clicks).await
    }

    async fn bounces(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Bounce>> {
        self.page(user_id, campaign_id, cursor, Resource::Bounces).await
    }

    async fn complaints(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Complaint>> {
        self.page(user_id, campaign_id, cursor, Resource::Complaints).await
    }

    async fn deliveries(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Delivery>> {
        self.page(user_id, campaign_id, cursor, Resource::Deliveries).await
    }

    async fn opens_stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<OpensStats> {
        let (unique, total) = self.unique_and_total("opens", user_id, campaign_id).await?;
        Ok(OpensStats { unique, total })
    }

    async fn clicks_stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<ClicksStats> {
        let (unique, total) = self.unique_and_total("clicks", user_id, campaign_id).await?;
        Ok(ClicksStats { unique, total })
    }

    async fn total_sent(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        self.count("sends", user_id, campaign_id).await
    }

    async fn total_delivered(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        self.count("deliveries", user_id, campaign_id).await
    }

    async fn total_bounces(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        self.count("bounces", user_id, campaign_id).await
    }

    async fn total_complaints(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        self.count("complaints", user_id, campaign_id).await
    }
}
