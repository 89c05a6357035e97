//! Repository layer for data access

pub mod campaigns;
pub mod events;
pub mod scheduled_campaigns;
pub mod segments;
pub mod subscriber_metrics;
pub mod subscribers;

pub use campaigns::{CampaignRepository, DbCampaignRepository};
pub use events::{DbEventRepository, EventRepository};
pub use scheduled_campaigns::{DbScheduledCampaignRepository, ScheduledCampaignRepository};
pub use segments::{DbSegmentRepository, SegmentRepository};
pub use subscriber_metrics::{DbSubscriberMetricsRepository, SubscriberMetricsRepository};
pub use subscribers::{DbSubscriberRepository, SubscriberRepository};

use crate::db::db_error;
use crate::pagination::{Pageable, Pagination, PaginationCursor};
use mailflock_common::types::UserId;
use mailflock_common::Result;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};

/// Run a cursor against PostgreSQL: one page query plus one count query.
pub(crate) async fn fetch_page<T>(
    pool: &PgPool,
    cursor: &PaginationCursor,
    user_id: UserId,
) -> Result<Pagination<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Pageable + Send + Unpin,
{
    let rows = fetch_rows(pool, cursor, user_id).await?;

    let mut count = cursor.count_query(user_id);
    let (total,) = count
        .build_query_as::<(i64,)>()
        .fetch_one(pool)
        .await
        .map_err(db_error)?;

    Ok(Pagination::from_rows(cursor, rows, total))
}

/// Up to `per_page + 1` rows of a cursor, without counting the total
pub(crate) async fn fetch_rows<T>(
    pool: &PgPool,
    cursor: &PaginationCursor,
    user_id: UserId,
) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Pageable + Send + Unpin,
{
    let mut select = cursor.select_query(user_id)?;
    select
        .build_query_as::<T>()
        .fetch_all(pool)
        .await
        .map_err(db_error)
}
