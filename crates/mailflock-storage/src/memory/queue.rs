use crate::topic_queue::{MessageQueue, QueuedMessage};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use mailflock_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-memory topic queue. Claimed messages stay invisible until acked or released.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    messages: Arc<Mutex<Vec<QueuedMessage>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads waiting on a topic, including claimed ones, oldest first
    pub async fn pending(&self, topic: &str) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
        let now = Utc::now();
        let id = Uuid::now_v7();
        self.messages.lock().await.push(QueuedMessage {
            id,
            topic: topic.to_string(),
            payload,
            attempts: 0,
            last_error: None,
            available_at: now,
            created_at: now,
        });
        Ok(id)
    }

    async fn claim(&self, topic: &str) -> Result<Option<QueuedMessage>> {
        let now = Utc::now();
        let mut messages = self.messages.lock().await;

        let next = messages
            .iter_mut()
            .filter(|m| m.topic == topic && m.available_at <= now)
            .min_by_key(|m| (m.available_at, m.id));

        Ok(next.map(|m| {
            // Held until ack or release
            m.available_at = now + Duration::days(365);
            m.clone()
        }))
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        self.messages.lock().await.retain(|m| m.id != id);
        Ok(())
    }

    async fn release(&self, id: Uuid, error: &str, retry_in: Duration) -> Result<()> {
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Message {} not found", id)))?;

        message.attempts += 1;
        message.last_error = Some(error.to_string());
        message.available_at = Utc::now() + retry_in;
        Ok(())
    }

    async fn extend(&self, id: Uuid) -> Result<()> {
        // Claims already hold until ack or release
        if self.messages.lock().await.iter().any(|m| m.id == id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Message {} not found", id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_claim_ack_release() {
        let queue = MemoryQueue::new();
        queue.enqueue("send_bulk", json!({"n": 1})).await.unwrap();
        queue.enqueue("send_bulk", json!({"n": 2})).await.unwrap();
        queue.enqueue("campaigns", json!({"n": 3})).await.unwrap();

        let first = queue.claim("send_bulk").await.unwrap().unwrap();
        assert_eq!(first.payload, json!({"n": 1}));

        let second = queue.claim("send_bulk").await.unwrap().unwrap();
        assert_eq!(second.payload, json!({"n": 2}));
        assert!(queue.claim("send_bulk").await.unwrap().is_none());

        queue.ack(first.id).await.unwrap();
        queue
            .release(second.id, "throttled", Duration::zero())
            .await
            .unwrap();

        let retried = queue.claim("send_bulk").await.unwrap().unwrap();
        assert_eq!(retried.id, second.id);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("throttled"));

        assert_eq!(queue.pending("send_bulk").await.len(), 1);
        assert_eq!(queue.pending("campaigns").await.len(), 1);

        queue.extend(retried.id).await.unwrap();
        assert!(matches!(queue.extend(first.id).await, Err(Error::NotFound(_))));
    }
}
