//! Campaign service - edit, send, schedule and report on campaigns

use crate::dispatch::{SendCampaignParams, SesKeys};
use crate::publisher::{publish_json, Publisher};
use crate::validation::{
    ensure_valid, validate_campaign, validate_campaign_update, validate_send_params,
};
use chrono::{DateTime, Utc};
use mailflock_common::config::TopicConfig;
use mailflock_common::types::{CampaignId, SegmentId, UserId};
use mailflock_common::{Error, Result};
use mailflock_storage::{
    Campaign, CampaignRepository, CampaignStats, CampaignStatus, CreateCampaign, EventRepository,
    ScheduleCampaign, ScheduledCampaign, ScheduledCampaignRepository, SegmentRepository,
    UpdateCampaign,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Caller supplied part of a send or schedule request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendCampaignRequest {
    pub segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub template_data: BTreeMap<String, String>,
    pub source: String,
    #[serde(default)]
    pub configuration_set_exists: bool,
    #[serde(default)]
    pub ses_keys: Option<SesKeys>,
}

pub struct CampaignService {
    campaigns: Arc<dyn CampaignRepository>,
    segments: Arc<dyn SegmentRepository>,
    schedules: Arc<dyn ScheduledCampaignRepository>,
    events: Arc<dyn EventRepository>,
    publisher: Arc<dyn Publisher>,
    topics: TopicConfig,
}

impl CampaignService {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        segments: Arc<dyn SegmentRepository>,
        schedules: Arc<dyn ScheduledCampaignRepository>,
        events: Arc<dyn EventRepository>,
        publisher: Arc<dyn Publisher>,
        topics: TopicConfig,
    ) -> Self {
        Self {
            campaigns,
            segments,
            schedules,
            events,
            publisher,
            topics,
        }
    }

    async fn campaign(&self, user_id: UserId, campaign_id: CampaignId) -> Result<Campaign> {
        self.campaigns
            .get(user_id, campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Campaign {} not found", campaign_id)))
    }

    pub async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        ensure_valid(validate_campaign(&input))?;
        self.campaigns.create(input).await
    }

    /// Rename a campaign or switch its template while it is a draft or scheduled
    pub async fn update(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
        input: UpdateCampaign,
    ) -> Result<Campaign> {
        ensure_valid(validate_campaign_update(&input))?;
        self.campaigns.update(user_id, campaign_id, input).await
    }

    pub async fn delete(&self, user_id: UserId, campaign_id: CampaignId) -> Result<()> {
        self.campaigns.delete(user_id, campaign_id).await?;
        info!(user_id, campaign_id, "Campaign deleted");
        Ok(())
    }

    /// Validate a request against a campaign that may still be sent
    async fn prepare(
        &self,
        user_id: UserId,
        user_uuid: &str,
        campaign_id: CampaignId,
        request: SendCampaignRequest,
    ) -> Result<SendCampaignParams> {
        let campaign = self.campaign(user_id, campaign_id).await?;
        if !matches!(
            campaign.status_enum(),
            Some(CampaignStatus::Draft | CampaignStatus::Scheduled)
        ) {
            return Err(Error::InvalidState(format!(
                "Campaign {} is {} and cannot be sent",
                campaign_id, campaign.status
            )));
        }

        let params = SendCampaignParams {
            segment_ids: request.segment_ids,
            template_data: request.template_data,
            source: request.source,
            user_id,
            user_uuid: user_uuid.to_string(),
            configuration_set_exists: request.configuration_set_exists,
            campaign,
            ses_keys: request.ses_keys,
        };
        ensure_valid(validate_send_params(&params))?;

        let wanted: BTreeSet<SegmentId> = params.segment_ids.iter().copied().collect();
        let found = self.segments.get_by_ids(user_id, &params.segment_ids).await?;
        if found.len() != wanted.len() {
            return Err(Error::NotFound(format!(
                "{} of {} segments not found",
                wanted.len() - found.len(),
                wanted.len()
            )));
        }
        Ok(params)
    }

    /// Queue a campaign for immediate sending
    pub async fn queue_send(
        &self,
        user_id: UserId,
        user_uuid: &str,
        campaign_id: CampaignId,
        request: SendCampaignRequest,
    ) -> Result<Uuid> {
        let params = self.prepare(user_id, user_uuid, campaign_id, request).await?;
        let msg_id = publish_json(self.publisher.as_ref(), &self.topics.campaigns, &params).await?;

        info!(user_id, campaign_id, message_id = %msg_id, "Campaign queued for sending");
        Ok(msg_id)
    }

    /// Create or replace the schedule of a campaign
    pub async fn schedule(
        &self,
        user_id: UserId,
        user_uuid: &str,
        campaign_id: CampaignId,
        scheduled_at: DateTime<Utc>,
        request: SendCampaignRequest,
    ) -> Result<ScheduledCampaign> {
        if scheduled_at <= Utc::now() {
            return Err(Error::invalid_field(
                "scheduled_at",
                "The scheduled time must be in the future.",
            ));
        }
        let params = self.prepare(user_id, user_uuid, campaign_id, request).await?;

        self.schedules
            .upsert(ScheduleCampaign {
                campaign_id,
                user_id,
                user_uuid: params.user_uuid,
                scheduled_at,
                source: params.source,
                segment_ids: params.segment_ids,
                template_data: params.template_data,
            })
            .await
    }

    /// Remove a schedule; the campaign returns to draft
    pub async fn unschedule(&self, user_id: UserId, campaign_id: CampaignId) -> Result<()> {
        self.schedules.delete(user_id, campaign_id).await
    }

    pub async fn stats(&self, user_id: UserId, campaign_id: CampaignId) -> Result<CampaignStats> {
        self.campaign(user_id, campaign_id).await?;
        self.events.stats(user_id, campaign_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mailflock_storage::{CreateSegment, MemoryQueue, MemoryStore};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: MemoryStore,
        queue: MemoryQueue,
        service: CampaignService,
        campaign_id: CampaignId,
        segment_id: SegmentId,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let queue = MemoryQueue::new();
        let segment = SegmentRepository::create(
            &store,
            CreateSegment {
                user_id: 7,
                name: "vip".to_string(),
            },
        )
        .await
        .unwrap();

        let service = CampaignService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            TopicConfig::default(),
        );
        let campaign = service
            .create(CreateCampaign {
                user_id: 7,
                name: "launch".to_string(),
                template_name: "welcome".to_string(),
            })
            .await
            .unwrap();
        Fixture {
            store,
            queue,
            service,
            campaign_id: campaign.id,
            segment_id: segment.id,
        }
    }

    fn request(segment_ids: Vec<SegmentId>) -> SendCampaignRequest {
        SendCampaignRequest {
            segment_ids,
            source: "news@example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_queue_send_publishes_params() {
        let f = fixture().await;
        f.service
            .queue_send(7, "u-1", f.campaign_id, request(vec![f.segment_id]))
            .await
            .unwrap();

        let pending = f.queue.pending("campaigns").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["campaign"]["id"], f.campaign_id);
        assert_eq!(pending[0]["user_uuid"], "u-1");
    }

    #[tokio::test]
    async fn test_queue_send_rejects_bad_requests() {
        let f = fixture().await;

        let err = f
            .service
            .queue_send(7, "u-1", f.campaign_id, request(vec![f.segment_id, 999]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = f
            .service
            .queue_send(7, "u-1", f.campaign_id, request(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));

        let err = f
            .service
            .queue_send(8, "u-2", f.campaign_id, request(vec![f.segment_id]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        f.store
            .transition_status(7, f.campaign_id, CampaignStatus::Sending)
            .await
            .unwrap();
        let err = f
            .service
            .queue_send(7, "u-1", f.campaign_id, request(vec![f.segment_id]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(f.queue.pending("campaigns").await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_and_unschedule() {
        let f = fixture().await;
        let at = Utc::now() + Duration::days(1);

        let err = f
            .service
            .schedule(
                7,
                "u-1",
                f.campaign_id,
                Utc::now() - Duration::minutes(1),
                request(vec![f.segment_id]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));

        let scheduled = f
            .service
            .schedule(7, "u-1", f.campaign_id, at, request(vec![f.segment_id]))
            .await
            .unwrap();
        assert_eq!(scheduled.segment_ids.0, vec![f.segment_id]);
        let campaign = CampaignRepository::get(&f.store, 7, f.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, "scheduled");

        f.service.unschedule(7, f.campaign_id).await.unwrap();
        let campaign = CampaignRepository::get(&f.store, 7, f.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, "draft");
    }

    #[tokio::test]
    async fn test_edits_are_validated() {
        let f = fixture().await;

        let err = f
            .service
            .create(CreateCampaign {
                user_id: 7,
                name: "  ".to_string(),
                template_name: "welcome".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
        assert_eq!(CampaignRepository::total(&f.store, 7).await.unwrap(), 1);

        let err = f
            .service
            .update(
                7,
                f.campaign_id,
                UpdateCampaign {
                    name: "relaunch".to_string(),
                    template_name: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));

        let renamed = f
            .service
            .update(
                7,
                f.campaign_id,
                UpdateCampaign {
                    name: "relaunch".to_string(),
                    template_name: "welcome-v2".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "relaunch");

        f.service.delete(7, f.campaign_id).await.unwrap();
        assert!(matches!(
            f.service.delete(7, f.campaign_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_require_campaign() {
        let f = fixture().await;
        f.store.record_send(7, f.campaign_id).await;

        let stats = f.service.stats(7, f.campaign_id).await.unwrap();
        assert_eq!(stats.total_sent, 1);
        assert!(matches!(
            f.service.stats(7, 12345).await,
            Err(Error::NotFound(_))
        ));
    }
}
