use super::MemoryStore;
use crate::models::{Bounce, Click, ClicksStats, Complaint, Delivery, Open, OpensStats};
use crate::pagination::{paginate_in_memory, Pagination, PaginationCursor, Resource};
use crate::repository::events::campaign_cursor;
use crate::repository::EventRepository;
use async_trait::async_trait;
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::Result;
use std::collections::HashSet;

/// Event ingestion used by tests and local tooling. Each call assigns the id.
macro_rules! recorder {
    ($($fn_name:ident => $field:ident : $event:ty),+ $(,)?) => {
        impl MemoryStore {
            $(
                pub async fn $fn_name(&self, mut event: $event) -> $event {
                    let mut state = self.state.write().await;
                    event.id = state.next_id();
                    state.$field.push(event.clone());
                    event
                }
            )+
        }
    };
}

recorder!(
    record_open => opens: Open,
    record_click => clicks: Click,
    record_bounce => bounces: Bounce,
    record_complaint => complaints: Complaint,
    record_delivery => deliveries: Delivery,
);

impl MemoryStore {
    /// Count one message handed to the provider
    pub async fn record_send(&self, user_id: UserId, campaign_id: CampaignId) {
        self.state.write().await.sends.push((user_id, campaign_id));
    }
}

fn unique_and_total<'a>(recipients: impl Iterator<Item = &'a str>) -> (i64, i64) {
    let mut seen = HashSet::new();
    let mut total = 0;
    for r in recipients {
        seen.insert(r);
        total += 1;
    }
    (seen.len() as i64, total)
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn opens(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Open>> {
        let cursor = campaign_cursor(cursor, Resource::Opens, campaign_id);
        let state = self.state.read().await;
        paginate_in_memory(&cursor, user_id, &state.opens)
    }

    async fn clicks(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Click>> {
        let cursor = campaign_cursor(cursor, Resource::Clicks, campaign_id);
        let state = self.state.read().await;
        paginate_in_memory(&cursor, user_id, &state.clicks)
    }

    async fn bounces(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Bounce>> {
        let cursor = campaign_cursor(cursor, Resource::Bounces, campaign_id);
        let state = self.state.read().await;
        paginate_in_memory(&cursor, user_id, &state.bounces)
    }

    async fn complaints(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Complaint>> {
        let cursor = campaign_cursor(cursor, Resource::Complaints, campaign_id);
        let state = self.state.read().await;
        paginate_in_memory(&cursor, user_id, &state.complaints)
    }

    async fn deliveries(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Delivery>> {
        let cursor = campaign_cursor(cursor, Resource::Deliveries, campaign_id);
        let state = self.state.read().await;
        paginate_in_memory(&cursor, user_id, &state.deliveries)
    }

    async fn opens_stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<OpensStats> {
        let state = self.state.read().await;
        let (unique, total) = unique_and_total(
            state
                .opens
                .iter()
                .filter(|e| e.user_id == user_id && e.campaign_id == campaign_id)
                .map(|e| e.recipient.as_str()),
        );
        Ok(OpensStats { unique, total })
    }

    async fn clicks_stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<ClicksStats> {
        let state = self.state.read().await;
        let (unique, total) = unique_and_total(
            state
                .clicks
                .iter()
                .filter(|e| e.user_id == user_id && e.campaign_id == campaign_id)
                .map(|e| e.recipient.as_str()),
        );
        Ok(ClicksStats { unique, total })
    }

    async fn total_sent(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .sends
            .iter()
            .filter(|(u, c)| *u == user_id && *c == campaign_id)
            .count() as i64)
    }

    async fn total_delivered(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .deliveries
            .iter()
            .filter(|e| e.user_id == user_id && e.campaign_id == campaign_id)
            .count() as i64)
    }

    async fn total_bounces(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .bounces
            .iter()
            .filter(|e| e.user_id == user_id && e.campaign_id == campaign_id)
            .count() as i64)
    }

    async fn total_complaints(&self, user_id: UserId, campaign_id: CampaignId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .complaints
            .iter()
            .filter(|e| e.user_id == user_id && e.campaign_id == campaign_id)
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CampaignStats;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn open(user_id: UserId, campaign_id: CampaignId, recipient: &str, minutes: i64) -> Open {
        Open {
            id: 0,
            user_id,
            campaign_id,
            recipient: recipient.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            ip_address: "203.0.113.9".to_string(),
            created_at: Utc::now() - Duration::minutes(minutes),
        }
    }

    #[tokio::test]
    async fn test_opens_stats_count_distinct_recipients() {
        let store = MemoryStore::new();
        store.record_open(open(7, 1, "a@example.com", 3)).await;
        store.record_open(open(7, 1, "a@example.com", 2)).await;
        store.record_open(open(7, 1, "b@example.com", 1)).await;
        store.record_open(open(7, 2, "c@example.com", 1)).await;
        store.record_open(open(8, 1, "d@example.com", 1)).await;

        assert_eq!(
            store.opens_stats(7, 1).await.unwrap(),
            OpensStats { unique: 2, total: 3 }
        );
        assert_eq!(
            store.opens_stats(7, 3).await.unwrap(),
            OpensStats { unique: 0, total: 0 }
        );
    }

    #[tokio::test]
    async fn test_opens_page_is_scoped_to_campaign() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .record_open(open(7, 1, &format!("r{}@example.com", i), i))
                .await;
        }
        store.record_open(open(7, 2, "other@example.com", 0)).await;

        let cursor = PaginationCursor::new(Resource::Opens, Some(2));
        let first = store.opens(7, 1, &cursor).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.collection.len(), 2);
        assert_eq!(first.collection[0].recipient, "r0@example.com");
        assert!(first.has_more);

        let next = cursor
            .starting_after(first.next_cursor.as_deref())
            .unwrap();
        let second = store.opens(7, 1, &next).await.unwrap();
        assert_eq!(second.collection[0].recipient, "r2@example.com");
    }

    #[tokio::test]
    async fn test_stats_combine_all_counters() {
        let store = MemoryStore::new();
        store.record_open(open(7, 1, "a@example.com", 1)).await;
        store.record_send(7, 1).await;
        store.record_send(7, 1).await;
        store
            .record_delivery(Delivery {
                id: 0,
                user_id: 7,
                campaign_id: 1,
                recipient: "a@example.com".to_string(),
                processing_time_millis: 412,
                smtp_response: "250 2.6.0 Message received".to_string(),
                reporting_mta: "a8-30.smtp-out.amazonses.com".to_string(),
                remote_mta_ip: "198.51.100.4".to_string(),
                created_at: Utc::now(),
            })
            .await;

        let stats = store.stats(7, 1).await.unwrap();
        assert_eq!(
            stats,
            CampaignStats {
                opens: OpensStats { unique: 1, total: 1 },
                clicks: ClicksStats { unique: 0, total: 0 },
                total_sent: 2,
                delivered: 1,
                bounces: 0,
                complaints: 0,
            }
        );
    }
}
