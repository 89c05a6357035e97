//! Subscriber repository

use crate::db::{db_error, DatabasePool};
use crate::models::{CreateSubscriber, Segment, Subscriber, UpdateSubscriber};
use crate::pagination::{PageToken, Pagination, PaginationCursor, Resource, Scope, SegmentScan};
use async_trait::async_trait;
use chrono::Utc;
use mailflock_common::types::{SegmentId, SubscriberId, UserId};
use mailflock_common::{Error, Result};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::BTreeSet;
use tracing::debug;

/// Subscriber repository trait
#[async_trait]
pub trait SubscriberRepository: Send + Sync {
    /// Create a subscriber and attach it to `segment_ids`.
    /// A second subscriber with the same email for the same user is a `Conflict`.
    async fn create(&self, input: CreateSubscriber) -> Result<Subscriber>;

    /// Get a subscriber with its segments
    async fn get(&self, user_id: UserId, id: SubscriberId) -> Result<Option<Subscriber>>;

    async fn get_by_email(&self, user_id: UserId, email: &str) -> Result<Option<Subscriber>>;

    async fn get_by_ids(&self, user_id: UserId, ids: &[SubscriberId]) -> Result<Vec<Subscriber>>;

    async fn list(&self, user_id: UserId, cursor: &PaginationCursor)
        -> Result<Pagination<Subscriber>>;

    /// One keyset page of the user's subscribers, newest first, strictly
    /// past `after`. Skips the total count, for full scans such as exports.
    async fn list_after(
        &self,
        user_id: UserId,
        after: Option<PageToken>,
        limit: i64,
    ) -> Result<Vec<Subscriber>>;

    /// Members of one segment
    async fn list_by_segment(
        &self,
        user_id: UserId,
        segment_id: SegmentId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Subscriber>>;

    /// Update scalar fields and replace segment membership in one transaction.
    /// Nothing is written if any target segment is missing.
    async fn update(
        &self,
        user_id: UserId,
        id: SubscriberId,
        input: UpdateSubscriber,
    ) -> Result<Subscriber>;

    /// Mark a subscriber inactive. Returns whether it was active before;
    /// an already inactive or missing subscriber is `Ok(false)`.
    async fn deactivate(&self, user_id: UserId, id: SubscriberId) -> Result<bool>;

    async fn deactivate_by_email(&self, user_id: UserId, email: &str) -> Result<bool>;

    /// Remove membership rows, then the subscriber, in one transaction.
    /// Missing subscribers are `NotFound`.
    async fn delete(&self, user_id: UserId, id: SubscriberId) -> Result<()>;

    async fn delete_by_email(&self, user_id: UserId, email: &str) -> Result<()>;

    async fn total(&self, user_id: UserId) -> Result<i64>;

    /// One batch of a segment membership scan
    async fn distinct_by_segments(&self, scan: &SegmentScan) -> Result<Vec<Subscriber>>;
}

/// Database subscriber repository
pub struct DbSubscriberRepository {
    pool: DatabasePool,
}

impl DbSubscriberRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn load_segments(&self, user_id: UserId, subscriber_id: SubscriberId) -> Result<Vec<Segment>> {
        sqlx::query_as::<_, Segment>(
            r#"
            SELECT s.* FROM segments s
            INNER JOIN subscribers_segments ss ON ss.segment_id = s.id
            WHERE ss.subscriber_id = $1 AND s.user_id = $2
            ORDER BY s.created_at DESC, s.id DESC
            "#,
        )
        .bind(subscriber_id)
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn with_segments(&self, subscriber: Option<Subscriber>) -> Result<Option<Subscriber>> {
        match subscriber {
            Some(mut s) => {
                s.segments = self.load_segments(s.user_id, s.id).await?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }
}

/// Attach a subscriber to segments owned by the same user.
/// Fails with `NotFound` when any id does not name one of the user's segments.
async fn attach_segments(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    subscriber_id: SubscriberId,
    segment_ids: &[SegmentId],
) -> Result<()> {
    let wanted: BTreeSet<SegmentId> = segment_ids.iter().copied().collect();
    if wanted.is_empty() {
        return Ok(());
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO subscribers_segments (subscriber_id, segment_id)
        SELECT $1, id FROM segments WHERE user_id = $2 AND id = ANY($3)
        "#,
    )
    .bind(subscriber_id)
    .bind(user_id)
    .bind(wanted.iter().copied().collect::<Vec<_>>())
    .execute(&mut **tx)
    .await
    .map_err(db_error)?
    .rows_affected();

    if inserted != wanted.len() as u64 {
        return Err(Error::NotFound(format!(
            "{} of {} segments not found",
            wanted.len() as u64 - inserted,
            wanted.len()
        )));
    }
    Ok(())
}

/// Subscriber cursor positioned after `after`, or at the first page
pub(crate) fn keyset_cursor(after: Option<PageToken>, limit: i64) -> PaginationCursor {
    let cursor = PaginationCursor::new(Resource::Subscribers, Some(limit));
    match after {
        Some(token) => cursor.after(token),
        None => cursor,
    }
}

#[async_trait]
impl SubscriberRepository for DbSubscriberRepository {
    async fn create(&self, input: CreateSubscriber) -> Result<Subscriber> {
        let now = Utc::now();
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            INSERT INTO subscribers (user_id, name, email, metadata, active, blacklisted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, true, false, $5, $5)
            RETURNING *
            "#,
        )
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.email)
        .bind(Json(&input.metadata))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match db_error(e) {
            Error::Conflict(_) => Error::Conflict(format!(
                "Subscriber with email {} already exists",
                input.email
            )),
            other => other,
        })?;

        attach_segments(&mut tx, input.user_id, subscriber.id, &input.segment_ids).await?;
        tx.commit().await.map_err(db_error)?;

        debug!(user_id = input.user_id, subscriber_id = subscriber.id, "Created subscriber");

        self.get(input.user_id, subscriber.id)
            .await?
            .ok_or_else(|| Error::Internal("Failed to create subscriber".to_string()))
    }

    async fn get(&self, user_id: UserId, id: SubscriberId) -> Result<Option<Subscriber>> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM subscribers WHERE user_id = $1 AND id = $2",
        )
        .bind(user_id)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)?;

        self.with_segments(subscriber).await
    }

    async fn get_by_email(&self, user_id: UserId, email: &str) -> Result<Option<Subscriber>> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM subscribers WHERE user_id = $1 AND email = $2",
        )
        .bind(user_id)
        .bind(email)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)?;

        self.with_segments(subscriber).await
    }

    async fn get_by_ids(&self, user_id: UserId, ids: &[SubscriberId]) -> Result<Vec<Subscriber>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT * FROM subscribers
            WHERE user_id = $1 AND id = ANY($2)
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .bind(ids.to_vec())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn list(
        &self,
        user_id: UserId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Subscriber>> {
        let mut cursor = cursor.clone();
        cursor.resource = Resource::Subscribers;
        super::fetch_page(self.pool.pool(), &cursor, user_id).await
    }

    async fn list_after(
        &self,
        user_id: UserId,
        after: Option<PageToken>,
        limit: i64,
    ) -> Result<Vec<Subscriber>> {
        let cursor = keyset_cursor(after, limit);
        let mut rows: Vec<Subscriber> =
            super::fetch_rows(self.pool.pool(), &cursor, user_id).await?;
        rows.truncate(cursor.per_page() as usize);
        Ok(rows)
    }

    async fn list_by_segment(
        &self,
        user_id: UserId,
        segment_id: SegmentId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Subscriber>> {
        let mut cursor = cursor.clone().with_scope(Scope::InSegment(segment_id));
        cursor.resource = Resource::Subscribers;
        super::fetch_page(self.pool.pool(), &cursor, user_id).await
    }

    async fn update(
        &self,
        user_id: UserId,
        id: SubscriberId,
        input: UpdateSubscriber,
    ) -> Result<Subscriber> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        let updated = sqlx::query_as::<_, Subscriber>(
            r#"
            UPDATE subscribers
            SET name = $3, metadata = $4, active = $5, updated_at = $6
            WHERE user_id = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(&input.name)
        .bind(Json(&input.metadata))
        .bind(input.active)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        if updated.is_none() {
            tx.rollback().await.map_err(db_error)?;
            return Err(Error::NotFound(format!("Subscriber {} not found", id)));
        }

        sqlx::query("DELETE FROM subscribers_segments WHERE subscriber_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        if let Err(e) = attach_segments(&mut tx, user_id, id, &input.segment_ids).await {
            tx.rollback().await.map_err(db_error)?;
            return Err(e);
        }

        tx.commit().await.map_err(db_error)?;

        debug!(user_id, subscriber_id = id, "Updated subscriber");

        self.get(user_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Subscriber {} not found", id)))
    }

    async fn deactivate(&self, user_id: UserId, id: SubscriberId) -> Result<bool> {
        let changed = sqlx::query(
            r#"
            UPDATE subscribers SET active = false, updated_at = $3
            WHERE user_id = $1 AND id = $2 AND active
            "#,
        )
        .bind(user_id)
        .bind(id)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?
        .rows_affected();
        Ok(changed > 0)
    }

    async fn deactivate_by_email(&self, user_id: UserId, email: &str) -> Result<bool> {
        let changed = sqlx::query(
            r#"
            UPDATE subscribers SET active = false, updated_at = $3
            WHERE user_id = $1 AND email = $2 AND active
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?
        .rows_affected();
        Ok(changed > 0)
    }

    async fn delete(&self, user_id: UserId, id: SubscriberId) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            DELETE FROM subscribers_segments
            WHERE subscriber_id = (SELECT id FROM subscribers WHERE user_id = $1 AND id = $2)
            "#,
        )
        .bind(user_id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let removed = sqlx::query("DELETE FROM subscribers WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();

        if removed == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(Error::NotFound(format!("Subscriber {} not found", id)));
        }

        tx.commit().await.map_err(db_error)?;
        debug!(user_id, subscriber_id = id, "Deleted subscriber");
        Ok(())
    }

    async fn delete_by_email(&self, user_id: UserId, email: &str) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            DELETE FROM subscribers_segments
            WHERE subscriber_id = (SELECT id FROM subscribers WHERE user_id = $1 AND email = $2)
            "#,
        )
        .bind(user_id)
        .bind(email)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let removed = sqlx::query("DELETE FROM subscribers WHERE user_id = $1 AND email = $2")
            .bind(user_id)
            .bind(email)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();

        if removed == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Err(Error::NotFound(format!(
                "Subscriber with email {} not found",
                email
            )));
        }

        tx.commit().await.map_err(db_error)?;
        debug!(user_id, "Deleted subscriber by email");
        Ok(())
    }

    async fn total(&self, user_id: UserId) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscribers WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn distinct_by_segments(&self, scan: &SegmentScan) -> Result<Vec<Subscriber>> {
        if scan.segment_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = scan.query();
        query
            .build_query_as::<Subscriber>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)
    }
}
