//! Topic message queue backed by the `topic_messages` table
//!
//! Producers insert rows. Consumers claim the oldest available row of a
//! topic with `FOR UPDATE SKIP LOCKED`; claiming pushes `available_at` out by
//! the lease, so a consumer that dies mid-message hands it back on expiry.
//! Long-running consumers call [`MessageQueue::extend`] to keep holding it.

use crate::db::{db_error, DatabasePool};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailflock_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, warn};
use uuid::Uuid;

/// Message claimed from a topic
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Topic queue operations
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append a message to a topic and return its id
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid>;

    /// Take the oldest available message of a topic
    async fn claim(&self, topic: &str) -> Result<Option<QueuedMessage>>;

    /// Remove a handled message
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Return a message to the topic after a failure, visible again after `retry_in`
    async fn release(&self, id: Uuid, error: &str, retry_in: Duration) -> Result<()>;

    /// Renew the lease of a claimed message. A message that is gone is `NotFound`.
    async fn extend(&self, id: Uuid) -> Result<()>;
}

/// PostgreSQL topic queue
#[derive(Clone)]
pub struct TopicQueue {
    pool: DatabasePool,
    lease: Duration,
}

impl TopicQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            lease: Duration::minutes(5),
        }
    }

    /// Override how long a claimed message stays invisible
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }
}

#[async_trait]
impl MessageQueue for TopicQueue {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO topic_messages (id, topic, payload, attempts, available_at, created_at)
            VALUES ($1, $2, $3, 0, $4, $4)
            "#,
        )
        .bind(id)
        .bind(topic)
        .bind(&payload)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        debug!(topic, message_id = %id, "Enqueued topic message");
        Ok(id)
    }

    async fn claim(&self, topic: &str) -> Result<Option<QueuedMessage>> {
        let now = Utc::now();

        sqlx::query_as::<_, QueuedMessage>(
            r#"
            UPDATE topic_messages
            SET available_at = $3
            WHERE id = (
                SELECT id FROM topic_messages
                WHERE topic = $1 AND available_at <= $2
                ORDER BY available_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, topic, payload, attempts, last_error, available_at, created_at
            "#,
        )
        .bind(topic)
        .bind(now)
        .bind(now + self.lease)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM topic_messages WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn release(&self, id: Uuid, error: &str, retry_in: Duration) -> Result<()> {
        warn!(message_id = %id, error, "Releasing topic message for retry");

        sqlx::query(
            r#"
            UPDATE topic_messages
            SET attempts = attempts + 1, last_error = $2, available_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now() + retry_in)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn extend(&self, id: Uuid) -> Result<()> {
        let extended = sqlx::query("UPDATE topic_messages SET available_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now() + self.lease)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?
            .rows_affected();

        if extended == 0 {
            return Err(Error::NotFound(format!("Message {} not found", id)));
        }
        debug!(message_id = %id, "Extended topic message lease");
        Ok(())
    }
}
