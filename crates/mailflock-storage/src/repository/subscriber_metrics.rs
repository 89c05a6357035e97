//! Subscriber metrics repository
//!
//! One row per user and day. Counters only grow; each change to the
//! subscriber base adds to the row of the day it happened.

use crate::db::{db_error, DatabasePool};
use crate::models::{MetricsDelta, SubscriberMetrics};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use mailflock_common::types::UserId;
use mailflock_common::Result;

/// Subscriber metrics repository trait
#[async_trait]
pub trait SubscriberMetricsRepository: Send + Sync {
    /// Add `delta` to the counters of `(user_id, date)`, creating the row on
    /// first use
    async fn increment(
        &self,
        user_id: UserId,
        date: NaiveDate,
        delta: MetricsDelta,
    ) -> Result<SubscriberMetrics>;

    async fn get(&self, user_id: UserId, date: NaiveDate) -> Result<Option<SubscriberMetrics>>;

    /// Days from `from` to `to` inclusive that have a row, oldest first
    async fn list_range(
        &self,
        user_id: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SubscriberMetrics>>;
}

/// Database subscriber metrics repository
pub struct DbSubscriberMetricsRepository {
    pool: DatabasePool,
}

impl DbSubscriberMetricsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriberMetricsRepository for DbSubscriberMetricsRepository {
    async fn increment(
        &self,
        user_id: UserId,
        date: NaiveDate,
        delta: MetricsDelta,
    ) -> Result<SubscriberMetrics> {
        sqlx::query_as::<_, SubscriberMetrics>(
            r#"
            INSERT INTO subscribers_metrics
                (user_id, date, created, deleted, unsubscribed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (user_id, date) DO UPDATE SET
                created = subscribers_metrics.created + EXCLUDED.created,
                deleted = subscribers_metrics.deleted + EXCLUDED.deleted,
                unsubscribed = subscribers_metrics.unsubscribed + EXCLUDED.unsubscribed,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(delta.created)
        .bind(delta.deleted)
        .bind(delta.unsubscribed)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn get(&self, user_id: UserId, date: NaiveDate) -> Result<Option<SubscriberMetrics>> {
        sqlx::query_as::<_, SubscriberMetrics>(
            "SELECT * FROM subscribers_metrics WHERE user_id = $1 AND date = $2",
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn list_range(
        &self,
        user_id: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SubscriberMetrics>> {
        sqlx::query_as::<_, SubscriberMetrics>(
            r#"
            SELECT * FROM subscribers_metrics
            WHERE user_id = $1 AND date BETWEEN $2 AND $3
            ORDER BY date ASC
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }
}
