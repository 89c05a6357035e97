use super::MemoryStore;
use crate::models::{CampaignStatus, ScheduleCampaign, ScheduledCampaign};
use crate::repository::campaigns::rejected_transition;
use crate::repository::ScheduledCampaignRepository;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::{Error, Result};
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

#[async_trait]
impl ScheduledCampaignRepository for MemoryStore {
    async fn upsert(&self, input: ScheduleCampaign) -> Result<ScheduledCampaign> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        match state.campaigns.get_mut(&input.campaign_id) {
            Some(c)
                if c.user_id == input.user_id
                    && c
                        .status_enum()
                        .is_some_and(|s| s.can_transition_to(CampaignStatus::Scheduled)) =>
            {
                c.status = CampaignStatus::Scheduled.to_string();
                c.scheduled_at = Some(input.scheduled_at);
                c.updated_at = now;
            }
            Some(c) if c.user_id == input.user_id => {
                return Err(rejected_transition(
                    input.campaign_id,
                    Some(&*c),
                    CampaignStatus::Scheduled,
                ))
            }
            _ => {
                return Err(rejected_transition(
                    input.campaign_id,
                    None,
                    CampaignStatus::Scheduled,
                ))
            }
        }

        let (id, created_at) = state
            .schedules
            .get(&input.campaign_id)
            .map_or((Uuid::now_v7(), now), |s| (s.id, s.created_at));

        let scheduled = ScheduledCampaign {
            id,
            campaign_id: input.campaign_id,
            user_id: input.user_id,
            user_uuid: input.user_uuid,
            scheduled_at: input.scheduled_at,
            source: input.source,
            segment_ids: Json(input.segment_ids),
            template_data: Json(input.template_data),
            claimed_until: None,
            created_at,
            updated_at: now,
        };
        state.schedules.insert(input.campaign_id, scheduled.clone());
        Ok(scheduled)
    }

    async fn get(
        &self,
        user_id: UserId,
        campaign_id: CampaignId,
    ) -> Result<Option<ScheduledCampaign>> {
        let state = self.state.read().await;
        Ok(state
            .schedules
            .get(&campaign_id)
            .filter(|s| s.user_id == user_id)
            .cloned())
    }

    async fn delete(&self, user_id: UserId, campaign_id: CampaignId) -> Result<()> {
        let mut state = self.state.write().await;

        if !state
            .schedules
            .get(&campaign_id)
            .is_some_and(|s| s.user_id == user_id)
        {
            return Err(Error::NotFound(format!(
                "Campaign {} has no schedule",
                campaign_id
            )));
        }
        state.schedules.remove(&campaign_id);

        if let Some(c) = state.campaigns.get_mut(&campaign_id) {
            if c.status_enum() == Some(CampaignStatus::Scheduled) {
                c.status = CampaignStatus::Draft.to_string();
                c.scheduled_at = None;
                c.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ScheduledCampaign>> {
        let mut state = self.state.write().await;

        let mut due: Vec<(DateTime<Utc>, CampaignId)> = state
            .schedules
            .values()
            .filter(|s| s.scheduled_at <= now)
            .filter(|s| s.claimed_until.map_or(true, |until| until <= now))
            .map(|s| (s.scheduled_at, s.campaign_id))
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(due
            .into_iter()
            .filter_map(|(_, campaign_id)| {
                let schedule = state.schedules.get_mut(&campaign_id)?;
                schedule.claimed_until = Some(now + lease);
                Some(schedule.clone())
            })
            .collect())
    }

    async fn complete_claim(&self, claimed: &ScheduledCampaign) -> Result<bool> {
        let mut state = self.state.write().await;
        if !holds_claim(&state.schedules, claimed) {
            return Ok(false);
        }
        state.schedules.remove(&claimed.campaign_id);
        Ok(true)
    }

    async fn release_claim(&self, claimed: &ScheduledCampaign) -> Result<bool> {
        let mut state = self.state.write().await;
        if !holds_claim(&state.schedules, claimed) {
            return Ok(false);
        }
        if let Some(s) = state.schedules.get_mut(&claimed.campaign_id) {
            s.claimed_until = None;
        }
        Ok(true)
    }
}

/// Whether `claimed` is still the live claim on its schedule
fn holds_claim(
    schedules: &BTreeMap<CampaignId, ScheduledCampaign>,
    claimed: &ScheduledCampaign,
) -> bool {
    schedules.get(&claimed.campaign_id).is_some_and(|s| {
        s.id == claimed.id
            && claimed.claimed_until.is_some()
            && s.claimed_until == claimed.claimed_until
    })
}
