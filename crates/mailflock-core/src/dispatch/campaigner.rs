//! Campaigner - consumes the `campaigns` topic and runs the dispatcher
//!
//! The claimed message's lease is renewed for as long as the send runs, so a
//! long dispatch is never handed to a second consumer.

use super::dispatcher::CampaignDispatcher;
use super::message::SendCampaignParams;
use chrono::Duration;
use mailflock_common::{Error, Result};
use mailflock_storage::{MessageQueue, QueuedMessage};
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration as TokioDuration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts before a `campaigns` message is dropped
const MAX_ATTEMPTS: i32 = 5;

/// In-process republish rounds for batches that failed to publish
const PUBLISH_RETRIES: u32 = 3;

/// Consumer of `campaigns` messages
pub struct Campaigner {
    queue: Arc<dyn MessageQueue>,
    dispatcher: CampaignDispatcher,
    topic: String,
    poll_interval_secs: u64,
    renew_every: TokioDuration,
}

impl Campaigner {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        dispatcher: CampaignDispatcher,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            topic: topic.into(),
            poll_interval_secs: 5,
            renew_every: TokioDuration::from_secs(60),
        }
    }

    /// Set poll interval used while the topic is empty
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs.max(1);
        self
    }

    /// Set how often the lease of the message being sent is renewed
    pub fn with_renew_interval(mut self, every: TokioDuration) -> Self {
        self.renew_every = every.max(TokioDuration::from_millis(10));
        self
    }

    /// Run until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(topic = %self.topic, "Campaigner started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let idle = match self.process_next(&cancel).await {
                Ok(handled) => !handled,
                Err(e) => {
                    error!("Error consuming {}: {}", self.topic, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(TokioDuration::from_secs(self.poll_interval_secs)) => {}
                }
            }
        }

        info!(topic = %self.topic, "Campaigner stopped");
    }

    /// Handle the next available message. Returns false when the topic is empty.
    pub async fn process_next(&self, cancel: &CancellationToken) -> Result<bool> {
        let Some(message) = self.queue.claim(&self.topic).await? else {
            return Ok(false);
        };

        let params: SendCampaignParams = match serde_json::from_value(message.payload.clone()) {
            Ok(params) => params,
            Err(e) => {
                error!(message_id = %message.id, "Dropping undecodable campaigns message: {}", e);
                self.queue.ack(message.id).await?;
                return Ok(true);
            }
        };

        debug!(
            message_id = %message.id,
            user_id = params.user_id,
            campaign_id = params.campaign.id,
            attempts = message.attempts,
            "Processing campaigns message"
        );

        let sent = tokio::select! {
            sent = self.send(&params, cancel) => sent,
            lost = self.hold_lease(message.id) => {
                warn!(
                    message_id = %message.id,
                    campaign_id = params.campaign.id,
                    "Lost the lease on a campaigns message, leaving it to the next consumer: {}",
                    lost
                );
                return Ok(true);
            }
        };

        match sent {
            Ok(()) => self.queue.ack(message.id).await?,
            Err(Error::Cancelled) => {
                self.queue
                    .release(message.id, "cancelled", Duration::zero())
                    .await?
            }
            Err(e) if e.is_retryable() => self.retry_later(&message, &e).await?,
            Err(e) => {
                warn!(
                    user_id = params.user_id,
                    campaign_id = params.campaign.id,
                    "Campaign cannot be sent: {}",
                    e
                );
                self.queue.ack(message.id).await?;
            }
        }
        Ok(true)
    }

    async fn send(&self, params: &SendCampaignParams, cancel: &CancellationToken) -> Result<()> {
        let mut report = self.dispatcher.dispatch(params, cancel).await?;

        let mut round = 0;
        while !report.completed && round < PUBLISH_RETRIES {
            round += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep(TokioDuration::from_secs(1 << round)) => {}
            }
            self.dispatcher.retry_failed(&mut report, cancel).await?;
        }

        if report.completed {
            Ok(())
        } else {
            Err(Error::Publish(format!(
                "{} of {} batches unpublished",
                report.failed_batches(),
                report.batches.len()
            )))
        }
    }

    /// Renew the message lease until it can no longer be held
    async fn hold_lease(&self, id: Uuid) -> Error {
        let mut ticker = interval(self.renew_every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.queue.extend(id).await {
                Ok(()) => debug!(message_id = %id, "Renewed campaigns message lease"),
                Err(e) if e.is_retryable() => {
                    warn!(message_id = %id, "Failed to renew lease, retrying: {}", e)
                }
                Err(e) => return e,
            }
        }
    }

    async fn retry_later(&self, message: &QueuedMessage, e: &Error) -> Result<()> {
        let attempts = message.attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            error!(
                message_id = %message.id,
                attempts,
                "Campaigns message exceeded max attempts: {}",
                e
            );
            return self.queue.ack(message.id).await;
        }

        self.queue
            .release(message.id, &e.to_string(), calculate_backoff(attempts))
            .await
    }
}

/// Exponential backoff: 1m, 2m, 4m, ... capped at one hour
fn calculate_backoff(attempts: i32) -> Duration {
    let minutes = 1i64 << attempts.clamp(0, 6);
    Duration::minutes(minutes.min(60))
}
