//! Subscriber service - validated writes and daily subscriber metrics

use crate::unsubscribe::{unsubscribe, UnsubscribeSigner};
use crate::validation::{ensure_valid, validate_subscriber, validate_subscriber_update};
use chrono::Utc;
use mailflock_common::types::{SubscriberId, UserId};
use mailflock_common::Result;
use mailflock_storage::{
    CreateSubscriber, MetricsDelta, Subscriber, SubscriberMetricsRepository, SubscriberRepository,
    UpdateSubscriber,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SubscriberService {
    subscribers: Arc<dyn SubscriberRepository>,
    metrics: Arc<dyn SubscriberMetricsRepository>,
}

impl SubscriberService {
    pub fn new(
        subscribers: Arc<dyn SubscriberRepository>,
        metrics: Arc<dyn SubscriberMetricsRepository>,
    ) -> Self {
        Self {
            subscribers,
            metrics,
        }
    }

    pub async fn create(&self, input: CreateSubscriber) -> Result<Subscriber> {
        ensure_valid(validate_subscriber(&input))?;
        let subscriber = self.subscribers.create(input).await?;
        self.record(subscriber.user_id, MetricsDelta::created(1)).await;
        Ok(subscriber)
    }

    pub async fn update(
        &self,
        user_id: UserId,
        id: SubscriberId,
        input: UpdateSubscriber,
    ) -> Result<Subscriber> {
        ensure_valid(validate_subscriber_update(&input))?;
        self.subscribers.update(user_id, id, input).await
    }

    pub async fn delete(&self, user_id: UserId, id: SubscriberId) -> Result<()> {
        self.subscribers.delete(user_id, id).await?;
        self.record(user_id, MetricsDelta::deleted(1)).await;
        Ok(())
    }

    pub async fn delete_by_email(&self, user_id: UserId, email: &str) -> Result<()> {
        self.subscribers.delete_by_email(user_id, email).await?;
        self.record(user_id, MetricsDelta::deleted(1)).await;
        Ok(())
    }

    /// Follow an unsubscribe link. Only the call that actually deactivates
    /// the subscriber is counted.
    pub async fn unsubscribe(
        &self,
        signer: &UnsubscribeSigner,
        user_id: UserId,
        email: &str,
        token: &str,
    ) -> Result<()> {
        if unsubscribe(self.subscribers.as_ref(), signer, user_id, email, token).await? {
            self.record(user_id, MetricsDelta::unsubscribed(1)).await;
        }
        Ok(())
    }

    /// Counters trail the change they describe; a failed increment is logged
    /// and does not undo it.
    async fn record(&self, user_id: UserId, delta: MetricsDelta) {
        let today = Utc::now().date_naive();
        match self.metrics.increment(user_id, today, delta).await {
            Ok(_) => debug!(user_id, ?delta, "Recorded subscriber metrics"),
            Err(e) => warn!(user_id, ?delta, "Failed to record subscriber metrics: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailflock_common::config::UnsubscribeConfig;
    use mailflock_common::Error;
    use mailflock_storage::{MemoryStore, SubscriberMetrics};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn service(store: &MemoryStore) -> SubscriberService {
        SubscriberService::new(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    fn input(email: &str) -> CreateSubscriber {
        CreateSubscriber {
            user_id: 7,
            name: "Jo".to_string(),
            email: email.to_string(),
            metadata: BTreeMap::new(),
            segment_ids: vec![],
        }
    }

    async fn today(store: &MemoryStore) -> Option<SubscriberMetrics> {
        SubscriberMetricsRepository::get(store, 7, Utc::now().date_naive())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_subscriber_is_rejected_before_storage() {
        let store = MemoryStore::new();
        let service = service(&store);

        for email in ["", "not-an-email", "jo@"] {
            let err = service.create(input(email)).await.unwrap_err();
            match err {
                Error::ValidationFailed(fields) => assert!(fields.contains_key("email")),
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(SubscriberRepository::total(&store, 7).await.unwrap(), 0);
        assert!(today(&store).await.is_none());

        let created = service.create(input("jo@example.com")).await.unwrap();
        let err = service
            .update(
                7,
                created.id,
                UpdateSubscriber {
                    name: "x".repeat(500),
                    metadata: BTreeMap::new(),
                    active: true,
                    segment_ids: vec![],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_metrics_follow_creates_deletes_and_unsubscribes() {
        let store = MemoryStore::new();
        let service = service(&store);
        let signer = UnsubscribeSigner::new(&UnsubscribeConfig {
            secret: "s3cret".to_string(),
            app_url: "https://app.example.com".to_string(),
        });

        let jo = service.create(input("jo@example.com")).await.unwrap();
        service.create(input("al@example.com")).await.unwrap();
        assert!(service.create(input("al@example.com")).await.is_err());

        let token = signer.token(jo.id).unwrap();
        service
            .unsubscribe(&signer, 7, "jo@example.com", &token)
            .await
            .unwrap();
        service
            .unsubscribe(&signer, 7, "jo@example.com", &token)
            .await
            .unwrap();

        service.delete(7, jo.id).await.unwrap();
        service.delete_by_email(7, "al@example.com").await.unwrap();
        assert!(matches!(
            service.delete(7, jo.id).await,
            Err(Error::NotFound(_))
        ));

        let metrics = today(&store).await.unwrap();
        assert_eq!(
            (metrics.created, metrics.deleted, metrics.unsubscribed),
            (2, 2, 1)
        );
    }
}
