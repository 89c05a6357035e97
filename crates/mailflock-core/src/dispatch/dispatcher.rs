//! Campaign dispatcher
//!
//! Turns one [`SendCampaignParams`] into a sequence of [`BulkSendMessage`]s on
//! the `send_bulk` topic. Recipients come from an ascending keyset scan of the
//! target segments bounded by a snapshot taken when dispatch starts, so every
//! eligible member present at that moment lands in exactly one batch.
//!
//! The snapshot and the scan position after the longest run of published
//! batches are saved on the campaign as it goes. A dispatch of a campaign
//! already in `sending` picks up from there instead of starting over.

use super::message::{
    BulkEmailDestination, BulkSendMessage, BulkTemplatedEmailInput, Destination, MessageTag,
    SendCampaignParams,
};
use crate::publisher::{publish_json, Publisher};
use crate::unsubscribe::UnsubscribeSigner;
use chrono::{DateTime, Utc};
use mailflock_common::config::{DispatchConfig, PROVIDER_BULK_LIMIT};
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::{Error, Result};
use mailflock_storage::{
    Campaign, CampaignRepository, CampaignStatus, DispatchProgress, PageToken, SegmentScan,
    Subscriber, SubscriberRepository,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of publishing one batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Zero-based position of the batch within the dispatch
    pub batch: usize,
    pub msg_uuid: Uuid,
    pub recipients: usize,
    pub error: Option<String>,
    /// Scan position just past the batch's last recipient
    pub resume_after: Option<PageToken>,
}

impl BatchOutcome {
    pub fn is_published(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-batch account of a dispatch
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub batches: Vec<BatchOutcome>,
    /// Messages that failed to publish, kept for [`CampaignDispatcher::retry_failed`]
    pub unpublished: Vec<BulkSendMessage>,
    /// Whether the campaign reached `sent`
    pub completed: bool,
    /// Recipient snapshot the scan is bounded by
    pub snapshot_at: DateTime<Utc>,
    /// Leading batches covered by the saved dispatch progress
    pub checkpointed: usize,
}

impl DispatchReport {
    pub fn recipients(&self) -> usize {
        self.batches.iter().map(|b| b.recipients).sum()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| !b.is_published()).count()
    }
}

/// Builds and publishes bulk-send messages for a campaign
pub struct CampaignDispatcher {
    subscribers: Arc<dyn SubscriberRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    publisher: Arc<dyn Publisher>,
    signer: UnsubscribeSigner,
    send_bulk_topic: String,
    batch_limit: usize,
    configuration_set: Option<String>,
}

impl CampaignDispatcher {
    pub fn new(
        subscribers: Arc<dyn SubscriberRepository>,
        campaigns: Arc<dyn CampaignRepository>,
        publisher: Arc<dyn Publisher>,
        signer: UnsubscribeSigner,
        send_bulk_topic: impl Into<String>,
    ) -> Self {
        Self {
            subscribers,
            campaigns,
            publisher,
            signer,
            send_bulk_topic: send_bulk_topic.into(),
            batch_limit: PROVIDER_BULK_LIMIT,
            configuration_set: None,
        }
    }

    /// Apply batch size and configuration set settings
    pub fn with_config(mut self, config: &DispatchConfig) -> Self {
        self.batch_limit = config.effective_batch_limit();
        self.configuration_set = config.configuration_set.clone();
        self
    }

    /// Recipients per message, clamped to the provider ceiling
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.clamp(1, PROVIDER_BULK_LIMIT);
        self
    }

    /// Dispatch a campaign.
    ///
    /// The campaign moves to `sending` before the first batch and to `sent`
    /// only when every batch was published. A batch that fails to publish is
    /// recorded in the report and the scan carries on with the next one.
    /// When the campaign carries progress from an earlier attempt, the scan
    /// resumes from it under the original snapshot.
    pub async fn dispatch(
        &self,
        params: &SendCampaignParams,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        let user_id = params.user_id;
        let campaign_id = params.campaign.id;

        let campaign = self
            .campaigns
            .transition_status(user_id, campaign_id, CampaignStatus::Sending)
            .await?;

        let progress = match campaign.dispatch_progress.as_ref() {
            Some(saved) => saved.0.clone(),
            None => {
                let fresh = DispatchProgress {
                    snapshot_at: Utc::now(),
                    after: None,
                };
                self.campaigns
                    .save_dispatch_progress(user_id, campaign_id, &fresh)
                    .await?;
                fresh
            }
        };

        let mut scan =
            SegmentScan::eligible(user_id, params.segment_ids.clone(), progress.snapshot_at)
                .with_limit(self.batch_limit as i64);
        scan.after = progress.after;

        info!(
            user_id,
            campaign_id,
            segments = ?params.segment_ids,
            batch_limit = self.batch_limit,
            resumed = progress.after.is_some(),
            "Dispatching campaign"
        );

        let mut report = DispatchReport {
            user_id,
            campaign_id,
            batches: Vec::new(),
            unpublished: Vec::new(),
            completed: false,
            snapshot_at: progress.snapshot_at,
            checkpointed: 0,
        };
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let subscribers = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                found = self.subscribers.distinct_by_segments(&scan) => found?,
            };
            let Some(last) = subscribers.last() else {
                break;
            };
            scan.advance_past(last);
            let exhausted = subscribers.len() < self.batch_limit;

            let recipients: Vec<&Subscriber> = subscribers
                .iter()
                .filter(|s| seen.insert(s.email.to_lowercase()))
                .collect();

            if !recipients.is_empty() {
                let message = self.build_message(params, &campaign, &recipients)?;
                let mut outcome = self.publish(report.batches.len(), &message, cancel).await?;
                outcome.resume_after = scan.after;
                if !outcome.is_published() {
                    report.unpublished.push(message);
                }
                report.batches.push(outcome);
                self.checkpoint(&mut report).await?;
            }

            if exhausted {
                break;
            }
        }

        self.finish(&mut report).await?;
        Ok(report)
    }

    /// Publish the messages a previous dispatch could not, then complete the
    /// campaign if nothing is left over
    pub async fn retry_failed(
        &self,
        report: &mut DispatchReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pending = std::mem::take(&mut report.unpublished).into_iter();

        while let Some(message) = pending.next() {
            let Some(index) = report
                .batches
                .iter()
                .position(|b| b.msg_uuid == message.uuid)
            else {
                continue;
            };

            let mut outcome = match self.publish(index, &message, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    report.unpublished.push(message);
                    report.unpublished.extend(pending);
                    return Err(e);
                }
            };
            if !outcome.is_published() {
                report.unpublished.push(message);
            }
            outcome.resume_after = report.batches[index].resume_after;
            report.batches[index] = outcome;
        }

        self.checkpoint(report).await?;
        self.finish(report).await
    }

    /// Save the scan position after the longest run of published batches
    async fn checkpoint(&self, report: &mut DispatchReport) -> Result<()> {
        let published = report
            .batches
            .iter()
            .take_while(|b| b.is_published())
            .count();
        if published <= report.checkpointed {
            return Ok(());
        }

        let progress = DispatchProgress {
            snapshot_at: report.snapshot_at,
            after: report.batches[published - 1].resume_after,
        };
        self.campaigns
            .save_dispatch_progress(report.user_id, report.campaign_id, &progress)
            .await?;
        report.checkpointed = published;

        debug!(
            campaign_id = report.campaign_id,
            batches = published,
            "Saved dispatch progress"
        );
        Ok(())
    }

    async fn finish(&self, report: &mut DispatchReport) -> Result<()> {
        let failed = report.failed_batches();
        if failed > 0 {
            warn!(
                user_id = report.user_id,
                campaign_id = report.campaign_id,
                failed,
                batches = report.batches.len(),
                "Campaign left in sending; some batches were not published"
            );
            return Ok(());
        }

        self.campaigns
            .transition_status(report.user_id, report.campaign_id, CampaignStatus::Sent)
            .await?;
        report.completed = true;

        info!(
            user_id = report.user_id,
            campaign_id = report.campaign_id,
            batches = report.batches.len(),
            recipients = report.recipients(),
            "Campaign sent"
        );
        Ok(())
    }

    async fn publish(
        &self,
        batch: usize,
        message: &BulkSendMessage,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let recipients = message.input.destinations.len();

        let published = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            published = publish_json(self.publisher.as_ref(), &self.send_bulk_topic, message) => published,
        };

        let error = match published {
            Ok(_) => {
                debug!(
                    campaign_id = message.campaign_id,
                    batch,
                    msg_uuid = %message.uuid,
                    recipients,
                    "Published bulk send batch"
                );
                None
            }
            Err(e) => {
                warn!(
                    campaign_id = message.campaign_id,
                    batch,
                    msg_uuid = %message.uuid,
                    error = %e,
                    "Failed to publish bulk send batch"
                );
                Some(e.to_string())
            }
        };

        Ok(BatchOutcome {
            batch,
            msg_uuid: message.uuid,
            recipients,
            error,
            resume_after: None,
        })
    }

    fn build_message(
        &self,
        params: &SendCampaignParams,
        campaign: &Campaign,
        recipients: &[&Subscriber],
    ) -> Result<BulkSendMessage> {
        let mut destinations = Vec::with_capacity(recipients.len());
        for subscriber in recipients {
            let mut data = subscriber.metadata.0.clone();
            data.insert(
                "unsubscribe_url".to_string(),
                self.signer.unsubscribe_url(subscriber, &params.user_uuid)?,
            );

            destinations.push(BulkEmailDestination {
                destination: Destination {
                    to_addresses: vec![subscriber.email.clone()],
                },
                replacement_template_data: encode(&data)?,
            });
        }

        let (configuration_set_name, default_tags) =
            match (params.configuration_set_exists, &self.configuration_set) {
                (true, Some(name)) => (
                    Some(name.clone()),
                    vec![
                        MessageTag::new("user_id", params.user_id),
                        MessageTag::new("campaign_id", campaign.id),
                    ],
                ),
                _ => (None, Vec::new()),
            };

        Ok(BulkSendMessage {
            uuid: Uuid::now_v7(),
            user_id: params.user_id,
            campaign_id: campaign.id,
            ses_keys: params.ses_keys.clone(),
            input: BulkTemplatedEmailInput {
                source: params.source.clone(),
                template: campaign.template_name.clone(),
                default_template_data: encode(&params.template_data)?,
                configuration_set_name,
                default_tags,
                destinations,
            },
        })
    }
}

fn encode<T: serde::Serialize>(data: &T) -> Result<String> {
    serde_json::to_string(data)
        .map_err(|e| Error::Internal(format!("Failed to encode template data: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::{seeded, signer};
    use async_trait::async_trait;
    use chrono::Duration;
    use mailflock_storage::{CreateSubscriber, MemoryQueue, MemoryStore};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(store: &MemoryStore, publisher: Arc<dyn Publisher>) -> CampaignDispatcher {
        CampaignDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            publisher,
            signer(),
            "send_bulk",
        )
    }

    fn decode(payloads: Vec<serde_json::Value>) -> Vec<BulkSendMessage> {
        payloads
            .into_iter()
            .map(|p| serde_json::from_value(p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_dispatch_splits_into_provider_sized_batches() {
        let (store, params) = seeded(2500).await;
        let queue = MemoryQueue::new();

        let report = dispatcher(&store, Arc::new(queue.clone()))
            .dispatch(&params, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.completed);
        let sizes: Vec<usize> = report.batches.iter().map(|b| b.recipients).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let messages = decode(queue.pending("send_bulk").await);
        assert_eq!(messages.len(), 3);
        let mut all = HashSet::new();
        for message in &messages {
            for recipient in message.recipients() {
                assert!(all.insert(recipient.to_string()), "{} sent twice", recipient);
            }
        }
        assert_eq!(all.len(), 2500);

        let campaign = CampaignRepository::get(&store, 7, params.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, "sent");
        assert!(campaign.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_message_carries_template_data() {
        let (store, params) = seeded(2).await;
        let queue = MemoryQueue::new();

        dispatcher(&store, Arc::new(queue.clone()))
            .dispatch(&params, &CancellationToken::new())
            .await
            .unwrap();

        let messages = decode(queue.pending("send_bulk").await);
        let message = &messages[0];
        assert_eq!(message.user_id, 7);
        assert_eq!(message.input.template, "welcome");
        assert_eq!(message.input.source, "Acme <news@acme.example>");
        assert_eq!(message.input.default_template_data, r#"{"company":"Acme"}"#);
        assert_eq!(message.ses_keys.as_ref().map(|k| k.region.as_str()), Some("eu-west-1"));

        let data: BTreeMap<String, String> =
            serde_json::from_str(&message.input.destinations[0].replacement_template_data)
                .unwrap();
        assert_eq!(data["plan"], "pro");
        assert!(data["unsubscribe_url"].starts_with("https://app.example.com/unsubscribe.html?email="));
    }

    #[tokio::test]
    async fn test_ineligible_and_late_subscribers_are_skipped() {
        let (store, params) = seeded(5).await;
        let blocked = SubscriberRepository::get_by_email(&store, 7, "member0@example.com")
            .await
            .unwrap()
            .unwrap();
        store.blacklist(7, blocked.id).await.unwrap();
        SubscriberRepository::deactivate_by_email(&store, 7, "member1@example.com")
            .await
            .unwrap();
        store
            .insert_subscriber_at(
                CreateSubscriber {
                    user_id: 7,
                    name: String::new(),
                    email: "late@example.com".to_string(),
                    metadata: BTreeMap::new(),
                    segment_ids: params.segment_ids.clone(),
                },
                Utc::now() + Duration::minutes(5),
            )
            .await
            .unwrap();
        let queue = MemoryQueue::new();

        let report = dispatcher(&store, Arc::new(queue.clone()))
            .dispatch(&params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.recipients(), 3);
    }

    /// Fails only the publish call numbered `fail_on`
    struct FlakyPublisher {
        inner: MemoryQueue,
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(Error::Publish("topic unavailable".to_string()));
            }
            self.inner.publish(topic, payload).await
        }
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_later_batches() {
        let (store, params) = seeded(25).await;
        let flaky = Arc::new(FlakyPublisher {
            inner: MemoryQueue::new(),
            calls: AtomicUsize::new(0),
            fail_on: 1,
        });
        let dispatcher = dispatcher(&store, flaky.clone()).with_batch_limit(10);
        let cancel = CancellationToken::new();

        let mut report = dispatcher.dispatch(&params, &cancel).await.unwrap();
        assert!(!report.completed);
        assert_eq!(report.batches.len(), 3);
        assert_eq!(report.failed_batches(), 1);
        assert!(!report.batches[1].is_published());
        assert!(report.batches[2].is_published());
        assert_eq!(flaky.inner.pending("send_bulk").await.len(), 2);

        let campaign = CampaignRepository::get(&store, 7, params.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, "sending");

        dispatcher.retry_failed(&mut report, &cancel).await.unwrap();
        assert!(report.completed);
        assert!(report.unpublished.is_empty());
        assert_eq!(flaky.inner.pending("send_bulk").await.len(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_dispatch_resumes_after_published_batches() {
        let (store, params) = seeded(15).await;
        let flaky = Arc::new(FlakyPublisher {
            inner: MemoryQueue::new(),
            calls: AtomicUsize::new(0),
            fail_on: 1,
        });
        let cancel = CancellationToken::new();

        let report = dispatcher(&store, flaky.clone())
            .with_batch_limit(5)
            .dispatch(&params, &cancel)
            .await
            .unwrap();
        assert!(!report.completed);
        assert_eq!(report.checkpointed, 1);
        let first_batch: HashSet<String> = decode(flaky.inner.pending("send_bulk").await)[0]
            .recipients()
            .map(str::to_string)
            .collect();
        assert_eq!(first_batch.len(), 5);

        store
            .insert_subscriber_at(
                CreateSubscriber {
                    user_id: 7,
                    name: String::new(),
                    email: "joined-later@example.com".to_string(),
                    metadata: BTreeMap::new(),
                    segment_ids: params.segment_ids.clone(),
                },
                Utc::now() + Duration::minutes(1),
            )
            .await
            .unwrap();

        // A later attempt, e.g. after the message was released for retry
        let queue = MemoryQueue::new();
        let resumed = dispatcher(&store, Arc::new(queue.clone()))
            .with_batch_limit(5)
            .dispatch(&params, &cancel)
            .await
            .unwrap();
        assert!(resumed.completed);
        assert_eq!(resumed.snapshot_at, report.snapshot_at);
        assert_eq!(resumed.recipients(), 10);

        let resent: Vec<String> = decode(queue.pending("send_bulk").await)
            .iter()
            .flat_map(|m| m.recipients().map(str::to_string).collect::<Vec<_>>())
            .collect();
        assert_eq!(resent.len(), 10);
        assert!(resent.iter().all(|r| !first_batch.contains(r)));
        assert!(!resent.contains(&"joined-later@example.com".to_string()));

        let campaign = CampaignRepository::get(&store, 7, params.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, "sent");
        assert!(campaign.dispatch_progress.is_none());
    }

    #[tokio::test]
    async fn test_sent_campaign_is_not_dispatched_again() {
        let (store, params) = seeded(3).await;
        let queue = MemoryQueue::new();
        let dispatcher = dispatcher(&store, Arc::new(queue.clone()));

        dispatcher
            .dispatch(&params, &CancellationToken::new())
            .await
            .unwrap();
        let err = dispatcher
            .dispatch(&params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(queue.pending("send_bulk").await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_stops() {
        let (store, params) = seeded(3).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher(&store, Arc::new(MemoryQueue::new()))
            .dispatch(&params, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
