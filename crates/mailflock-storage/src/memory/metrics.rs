use super::MemoryStore;
use crate::models::{MetricsDelta, SubscriberMetrics};
use crate::repository::SubscriberMetricsRepository;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use mailflock_common::types::UserId;
use mailflock_common::Result;

#[async_trait]
impl SubscriberMetricsRepository for MemoryStore {
    async fn increment(
        &self,
        user_id: UserId,
        date: NaiveDate,
        delta: MetricsDelta,
    ) -> Result<SubscriberMetrics> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let id = match state.subscriber_metrics.get(&(user_id, date)) {
            Some(row) => row.id,
            None => state.next_id(),
        };
        let row = state
            .subscriber_metrics
            .entry((user_id, date))
            .or_insert_with(|| SubscriberMetrics {
                id,
                user_id,
                date,
                created: 0,
                deleted: 0,
                unsubscribed: 0,
                created_at: now,
                updated_at: now,
            });
        row.created += delta.created;
        row.deleted += delta.deleted;
        row.unsubscribed += delta.unsubscribed;
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn get(&self, user_id: UserId, date: NaiveDate) -> Result<Option<SubscriberMetrics>> {
        let state = self.state.read().await;
        Ok(state.subscriber_metrics.get(&(user_id, date)).cloned())
    }

    async fn list_range(
        &self,
        user_id: UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SubscriberMetrics>> {
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .subscriber_metrics
            .range((user_id, from)..=(user_id, to))
            .map(|(_, row)| row.clone())
            .collect())
    }
}
