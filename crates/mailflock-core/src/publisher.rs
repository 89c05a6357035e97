//! Topic publisher seam between the dispatch stages

use async_trait::async_trait;
use mailflock_common::{Error, Result};
use mailflock_storage::{MemoryQueue, MessageQueue, TopicQueue};
use serde::Serialize;
use uuid::Uuid;

/// Accepts messages for a topic. Delivery guarantees belong to the implementation.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid>;
}

#[async_trait]
impl Publisher for TopicQueue {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
        self.enqueue(topic, payload)
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
        self.enqueue(topic, payload).await
    }
}

/// Serialize `message` and publish it
pub async fn publish_json<T: Serialize + ?Sized>(
    publisher: &dyn Publisher,
    topic: &str,
    message: &T,
) -> Result<Uuid> {
    let payload = serde_json::to_value(message)
        .map_err(|e| Error::Internal(format!("Failed to encode {} message: {}", topic, e)))?;
    publisher.publish(topic, payload).await
}
