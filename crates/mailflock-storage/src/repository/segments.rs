//! Segment repository

use crate::db::{db_error, DatabasePool};
use crate::models::{CreateSegment, Segment};
use crate::pagination::{Pagination, PaginationCursor, Resource};
use async_trait::async_trait;
use chrono::Utc;
use mailflock_common::types::{SegmentId, SubscriberId, UserId};
use mailflock_common::{Error, Result};
use tracing::debug;

const SEGMENT_WITH_COUNT: &str = r#"
    SELECT segments.*,
        (SELECT COUNT(*) FROM subscribers_segments ss WHERE ss.segment_id = segments.id)
            AS subscribers_in_segment
    FROM segments
"#;

/// Segment repository trait
#[async_trait]
pub trait SegmentRepository: Send + Sync {
    /// Segment names are unique per user; duplicates are a `Conflict`
    async fn create(&self, input: CreateSegment) -> Result<Segment>;

    /// Get a segment with its member count
    async fn get(&self, user_id: UserId, id: SegmentId) -> Result<Option<Segment>>;

    async fn get_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Segment>>;

    async fn get_by_ids(&self, user_id: UserId, ids: &[SegmentId]) -> Result<Vec<Segment>>;

    async fn list(&self, user_id: UserId, cursor: &PaginationCursor) -> Result<Pagination<Segment>>;

    async fn rename(&self, user_id: UserId, id: SegmentId, name: &str) -> Result<Segment>;

    /// Drop membership rows, then the segment. Subscribers are kept.
    /// Missing segments are `NotFound`.
    async fn delete(&self, user_id: UserId, id: SegmentId) -> Result<()>;

    async fn total(&self, user_id: UserId) -> Result<i64>;

    async fn total_subscribers(&self, user_id: UserId, id: SegmentId) -> Result<i64>;

    /// Add the user's subscribers to a segment; existing members are skipped.
    /// Returns the number of new memberships.
    async fn append_subscribers(
        &self,
        user_id: UserId,
        id: SegmentId,
        subscriber_ids: &[SubscriberId],
    ) -> Result<u64>;

    /// Remove subscribers from a segment. Returns the number removed.
    async fn detach_subscribers(
        &self,
        user_id: UserId,
        id: SegmentId,
        subscriber_ids: &[SubscriberId],
    ) -> Result<u64>;
}

/// Database segment repository
pub struct DbSegmentRepository {
    pool: DatabasePool,
}

impl DbSegmentRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn require(&self, user_id: UserId, id: SegmentId) -> Result<()> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM segments WHERE user_id = $1 AND id = $2)",
        )
        .bind(user_id)
        .bind(id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)?;

        if exists {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Segment {} not found", id)))
        }
    }
}

fn name_conflict(name: &str) -> impl Fn(sqlx::Error) -> Error + '_ {
    move |e| match db_error(e) {
        Error::Conflict(_) => Error::Conflict(format!("Segment {} already exists", name)),
        other => other,
    }
}

#[async_trait]
impl SegmentRepository for DbSegmentRepository {
    async fn create(&self, input: CreateSegment) -> Result<Segment> {
        let now = Utc::now();
        let segment = sqlx::query_as::<_, Segment>(
            r#"
            INSERT INTO segments (user_id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(&input.name)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(name_conflict(&input.name))?;

        debug!(user_id = input.user_id, segment_id = segment.id, "Created segment");
        Ok(segment)
    }

    async fn get(&self, user_id: UserId, id: SegmentId) -> Result<Option<Segment>> {
        sqlx::query_as::<_, Segment>(&format!(
            "{} WHERE segments.user_id = $1 AND segments.id = $2",
            SEGMENT_WITH_COUNT
        ))
        .bind(user_id)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn get_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Segment>> {
        sqlx::query_as::<_, Segment>(&format!(
            "{} WHERE segments.user_id = $1 AND segments.name = $2",
            SEGMENT_WITH_COUNT
        ))
        .bind(user_id)
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn get_by_ids(&self, user_id: UserId, ids: &[SegmentId]) -> Result<Vec<Segment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, Segment>(&format!(
            "{} WHERE segments.user_id = $1 AND segments.id = ANY($2) \
             ORDER BY segments.created_at DESC, segments.id DESC",
            SEGMENT_WITH_COUNT
        ))
        .bind(user_id)
        .bind(ids.to_vec())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn list(&self, user_id: UserId, cursor: &PaginationCursor) -> Result<Pagination<Segment>> {
        let mut cursor = cursor.clone();
        cursor.resource = Resource::Segments;
        super::fetch_page(self.pool.pool(), &cursor, user_id).await
    }

    async fn rename(&self, user_id: UserId, id: SegmentId, name: &str) -> Result<Segment> {
        sqlx::query(
            "UPDATE segments SET name = $3, updated_at = $4 WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(name_conflict(name))?;

        self.get(user_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Segment {} not found", id)))
    }

    async fn delete(&self, user_id: UserId, id: SegmentId) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            DELETE FROM subscribers_segments
            WHERE segment_id = (SELECT id FROM segments WHERE user_id = $1 AND id = $2)
            "#,
        )
        .bind(user_id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let removed = sqlx::query("DELETE FROM segments WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();

        if removed == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(Error::NotFound(format!("Segment {} not found", id)));
        }

        tx.commit().await.map_err(db_error)?;
        debug!(user_id, segment_id = id, "Deleted segment");
        Ok(())
    }

    async fn total(&self, user_id: UserId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM segments WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn total_subscribers(&self, user_id: UserId, id: SegmentId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM subscribers_segments ss
            INNER JOIN segments s ON s.id = ss.segment_id
            WHERE s.user_id = $1 AND s.id = $2
            "#,
        )
        .bind(user_id)
        .bind(id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn append_subscribers(
        &self,
        user_id: UserId,
        id: SegmentId,
        subscriber_ids: &[SubscriberId],
    ) -> Result<u64> {
        self.require(user_id, id).await?;
        if subscriber_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO subscribers_segments (subscriber_id, segment_id)
            SELECT id, $2 FROM subscribers WHERE user_id = $1 AND id = ANY($3)
            ON CONFLICT (subscriber_id, segment_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(subscriber_ids.to_vec())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn detach_subscribers(
        &self,
        user_id: UserId,
        id: SegmentId,
        subscriber_ids: &[SubscriberId],
    ) -> Result<u64> {
        self.require(user_id, id).await?;
        if subscriber_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "DELETE FROM subscribers_segments WHERE segment_id = $1 AND subscriber_id = ANY($2)",
        )
        .bind(id)
        .bind(subscriber_ids.to_vec())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}
