//! Scheduled campaign poller
//!
//! Claims due schedules under a lease and publishes each as a `campaigns`
//! message. A schedule is removed only after its message is out; one that
//! cannot be published is released for the next poll, and one whose release
//! also fails comes back when the lease expires.

use super::message::SendCampaignParams;
use crate::publisher::{publish_json, Publisher};
use chrono::{DateTime, Duration, Utc};
use mailflock_common::config::SchedulerConfig;
use mailflock_common::Result;
use mailflock_storage::{
    CampaignRepository, CampaignStatus, ScheduledCampaign, ScheduledCampaignRepository,
};
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest accepted claim lease
const MAX_CLAIM_LEASE_SECS: u64 = 24 * 60 * 60;

pub struct ScheduledCampaignPoller {
    schedules: Arc<dyn ScheduledCampaignRepository>,
    campaigns: Arc<dyn CampaignRepository>,
    publisher: Arc<dyn Publisher>,
    topic: String,
    batch_size: i64,
    poll_interval_secs: u64,
    claim_lease: Duration,
    configuration_set_exists: bool,
}

impl ScheduledCampaignPoller {
    pub fn new(
        schedules: Arc<dyn ScheduledCampaignRepository>,
        campaigns: Arc<dyn CampaignRepository>,
        publisher: Arc<dyn Publisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            schedules,
            campaigns,
            publisher,
            topic: topic.into(),
            batch_size: 100,
            poll_interval_secs: 30,
            claim_lease: Duration::minutes(5),
            configuration_set_exists: false,
        }
    }

    pub fn with_config(mut self, config: &SchedulerConfig) -> Self {
        self.batch_size = config.batch_size.max(1);
        self.poll_interval_secs = config.poll_interval_secs.max(1);
        self.claim_lease =
            Duration::seconds(config.claim_lease_secs.clamp(1, MAX_CLAIM_LEASE_SECS) as i64);
        self
    }

    /// Whether published sends should name the configured configuration set
    pub fn with_configuration_set(mut self, exists: bool) -> Self {
        self.configuration_set_exists = exists;
        self
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    /// Run until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(TokioDuration::from_secs(self.poll_interval_secs));

        info!(
            "Scheduled campaign poller started (batch: {}, interval: {}s, lease: {}s)",
            self.batch_size,
            self.poll_interval_secs,
            self.claim_lease.num_seconds()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.poll_once(Utc::now()).await {
                error!("Error polling scheduled campaigns: {}", e);
            }
        }

        info!("Scheduled campaign poller stopped");
    }

    /// Publish every schedule due at `now`; returns how many were published.
    /// Only the claim itself can fail the poll; per-schedule failures are
    /// logged and left to the lease.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .schedules
            .claim_due(now, self.claim_lease, self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Claimed due schedules");

        let mut published = 0;
        for schedule in &due {
            match self.publish(schedule).await {
                Ok(fired) => {
                    if fired {
                        published += 1;
                    }
                    self.complete(schedule).await;
                }
                Err(e) => {
                    warn!(
                        user_id = schedule.user_id,
                        campaign_id = schedule.campaign_id,
                        "Failed to publish scheduled campaign, releasing schedule: {}",
                        e
                    );
                    self.release(schedule).await;
                }
            }
        }
        Ok(published)
    }

    /// Publish the campaign message of a schedule. `Ok(false)` means the
    /// schedule is stale and should be dropped without sending.
    async fn publish(&self, schedule: &ScheduledCampaign) -> Result<bool> {
        let Some(campaign) = self
            .campaigns
            .get(schedule.user_id, schedule.campaign_id)
            .await?
        else {
            warn!(
                user_id = schedule.user_id,
                campaign_id = schedule.campaign_id,
                "Dropping schedule of a deleted campaign"
            );
            return Ok(false);
        };

        if campaign.status_enum() != Some(CampaignStatus::Scheduled) {
            warn!(
                user_id = schedule.user_id,
                campaign_id = schedule.campaign_id,
                status = %campaign.status,
                "Dropping schedule of a campaign that is no longer scheduled"
            );
            return Ok(false);
        }

        let params = SendCampaignParams {
            segment_ids: schedule.segment_ids.0.clone(),
            template_data: schedule.template_data.0.clone(),
            source: schedule.source.clone(),
            user_id: schedule.user_id,
            user_uuid: schedule.user_uuid.clone(),
            configuration_set_exists: self.configuration_set_exists,
            campaign,
            ses_keys: None,
        };
        let msg_id = publish_json(self.publisher.as_ref(), &self.topic, &params).await?;

        info!(
            user_id = schedule.user_id,
            campaign_id = schedule.campaign_id,
            message_id = %msg_id,
            "Scheduled campaign queued for sending"
        );
        Ok(true)
    }

    async fn complete(&self, schedule: &ScheduledCampaign) {
        match self.schedules.complete_claim(schedule).await {
            Ok(true) => {}
            Ok(false) => debug!(
                campaign_id = schedule.campaign_id,
                "Schedule changed while claimed, leaving it in place"
            ),
            Err(e) => error!(
                campaign_id = schedule.campaign_id,
                "Failed to remove fired schedule: {}", e
            ),
        }
    }

    async fn release(&self, schedule: &ScheduledCampaign) {
        match self.schedules.release_claim(schedule).await {
            Ok(_) => {}
            Err(e) => error!(
                campaign_id = schedule.campaign_id,
                "Failed to release schedule, retrying after the lease: {}", e
            ),
        }
    }
}
