use super::MemoryStore;
use crate::models::{Campaign, CampaignStatus, CreateCampaign, DispatchProgress, UpdateCampaign};
use crate::pagination::{paginate_in_memory, Pageable, Pagination, PaginationCursor};
use crate::repository::campaigns::rejected_transition;
use crate::repository::CampaignRepository;
use async_trait::async_trait;
use chrono::Utc;
use mailflock_common::types::{CampaignId, UserId};
use mailflock_common::{Error, Result};
use sqlx::types::Json;

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let mut state = self.state.write().await;

        if state
            .campaigns
            .values()
            .any(|c| c.user_id == input.user_id && c.name == input.name)
        {
            return Err(Error::Conflict(format!(
                "Campaign {} already exists",
                input.name
            )));
        }

        let now = Utc::now();
        let campaign = Campaign {
            id: state.next_id(),
            user_id: input.user_id,
            name: input.name,
            template_name: input.template_name,
            status: CampaignStatus::Draft.to_string(),
            scheduled_at: None,
            completed_at: None,
            dispatch_progress: None,
            created_at: now,
            updated_at: now,
        };
        state.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, user_id: UserId, id: CampaignId) -> Result<Option<Campaign>> {
        let state = self.state.read().await;
        Ok(state
            .campaigns
            .get(&id)
            .filter(|c| c.user_id == user_id)
            .cloned())
    }

    async fn get_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Campaign>> {
        let state = self.state.read().await;
        Ok(state
            .campaigns
            .values()
            .find(|c| c.user_id == user_id && c.name == name)
            .cloned())
    }

    async fn list(
        &self,
        user_id: UserId,
        cursor: &PaginationCursor,
    ) -> Result<Pagination<Campaign>> {
        let state = self.state.read().await;
        paginate_in_memory(cursor, user_id, state.campaigns.values())
    }

    async fn list_by_template_name(
        &self,
        user_id: UserId,
        template_name: &str,
    ) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut found: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.user_id == user_id && c.template_name == template_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.page_key().cmp(&a.page_key()));
        Ok(found)
    }

    async fn update(
        &self,
        user_id: UserId,
        id: CampaignId,
        input: UpdateCampaign,
    ) -> Result<Campaign> {
        let mut state = self.state.write().await;

        if state
            .campaigns
            .values()
            .any(|c| c.user_id == user_id && c.name == input.name && c.id != id)
        {
            return Err(Error::Conflict(format!(
                "Campaign {} already exists",
                input.name
            )));
        }

        match state.campaigns.get_mut(&id) {
            Some(c) if c.user_id == user_id => {
                if !matches!(
                    c.status_enum(),
                    Some(CampaignStatus::Draft | CampaignStatus::Scheduled)
                ) {
                    return Err(Error::InvalidState(format!(
                        "Campaign {} is {} and can no longer be edited",
                        id, c.status
                    )));
                }
                c.name = input.name;
                c.template_name = input.template_name;
                c.updated_at = Utc::now();
                Ok(c.clone())
            }
            _ => Err(Error::NotFound(format!("Campaign {} not found", id))),
        }
    }

    async fn delete(&self, user_id: UserId, id: CampaignId) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.campaigns.get(&id).is_some_and(|c| c.user_id == user_id) {
            return Err(Error::NotFound(format!("Campaign {} not found", id)));
        }
        state.campaigns.remove(&id);
        state.schedules.remove(&id);
        Ok(())
    }

    async fn total(&self, user_id: UserId) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.campaigns.values().filter(|c| c.user_id == user_id).count() as i64)
    }

    async fn transition_status(
        &self,
        user_id: UserId,
        id: CampaignId,
        next: CampaignStatus,
    ) -> Result<Campaign> {
        let mut state = self.state.write().await;

        match state.campaigns.get_mut(&id) {
            Some(c)
                if c.user_id == user_id
                    && c.status_enum().is_some_and(|s| s.can_transition_to(next)) =>
            {
                let now = Utc::now();
                c.status = next.to_string();
                if next == CampaignStatus::Sent {
                    c.completed_at = Some(now);
                }
                if next != CampaignStatus::Sending {
                    c.dispatch_progress = None;
                }
                c.updated_at = now;
                Ok(c.clone())
            }
            Some(c) if c.user_id == user_id => Err(rejected_transition(id, Some(&*c), next)),
            _ => Err(rejected_transition(id, None, next)),
        }
    }

    async fn save_dispatch_progress(
        &self,
        user_id: UserId,
        id: CampaignId,
        progress: &DispatchProgress,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        match state.campaigns.get_mut(&id) {
            Some(c)
                if c.user_id == user_id && c.status_enum() == Some(CampaignStatus::Sending) =>
            {
                c.dispatch_progress = Some(Json(progress.clone()));
                c.updated_at = Utc::now();
                Ok(())
            }
            Some(c) if c.user_id == user_id => Err(rejected_transition(
                id,
                Some(&*c),
                CampaignStatus::Sending,
            )),
            _ => Err(rejected_transition(id, None, CampaignStatus::Sending)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::Resource;
    use std::collections::BTreeMap;

    fn draft(user_id: UserId, name: &str, template: &str) -> CreateCampaign {
        CreateCampaign {
            user_id,
            name: name.to_string(),
            template_name: template.to_string(),
        }
    }

    #[tokio::test]
    async fn test_status_moves_forward_only() {
        let store = MemoryStore::new();
        let c = store.create(draft(7, "launch", "welcome")).await.unwrap();
        assert_eq!(c.status, "draft");

        let c = store
            .transition_status(7, c.id, CampaignStatus::Sending)
            .await
            .unwrap();
        assert_eq!(c.status, "sending");

        let c = store
            .transition_status(7, c.id, CampaignStatus::Sent)
            .await
            .unwrap();
        assert!(c.completed_at.is_some());

        let err = store
            .transition_status(7, c.id, CampaignStatus::Draft)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = store
            .transition_status(8, c.id, CampaignStatus::Sending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = store
            .update(
                7,
                c.id,
                UpdateCampaign {
                    name: "relaunch".to_string(),
                    template_name: "welcome".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_dispatch_progress_lives_while_sending() {
        let store = MemoryStore::new();
        let c = store.create(draft(7, "launch", "welcome")).await.unwrap();
        let progress = DispatchProgress {
            snapshot_at: Utc::now(),
            after: None,
        };

        let err = store.save_dispatch_progress(7, c.id, &progress).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        store
            .transition_status(7, c.id, CampaignStatus::Sending)
            .await
            .unwrap();
        store.save_dispatch_progress(7, c.id, &progress).await.unwrap();
        let resumed = store
            .transition_status(7, c.id, CampaignStatus::Sending)
            .await
            .unwrap();
        assert_eq!(resumed.dispatch_progress.map(|p| p.0), Some(progress.clone()));

        let sent = store
            .transition_status(7, c.id, CampaignStatus::Sent)
            .await
            .unwrap();
        assert!(sent.dispatch_progress.is_none());
        assert!(matches!(
            store.save_dispatch_progress(8, c.id, &progress).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_of_missing_or_foreign_campaign_is_not_found() {
        let store = MemoryStore::new();
        let c = store.create(draft(7, "launch", "welcome")).await.unwrap();

        assert!(matches!(store.delete(8, c.id).await, Err(Error::NotFound(_))));
        assert!(store.get(7, c.id).await.unwrap().is_some());

        store.delete(7, c.id).await.unwrap();
        assert!(matches!(store.delete(7, c.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_with_prefix_scopes() {
        let store = MemoryStore::new();
        store.create(draft(7, "spring-sale", "promo-a")).await.unwrap();
        store.create(draft(7, "spring-news", "news")).await.unwrap();
        store.create(draft(7, "autumn", "promo-b")).await.unwrap();
        assert!(matches!(
            store.create(draft(7, "autumn", "promo-b")).await,
            Err(Error::Conflict(_))
        ));

        let mut filters = BTreeMap::new();
        filters.insert("name".to_string(), "spring".to_string());
        filters.insert("template_name".to_string(), "promo".to_string());
        let cursor = PaginationCursor::new(Resource::Campaigns, None).with_filters(&filters);

        let page = store.list(7, &cursor).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.collection[0].name, "spring-sale");

        assert_eq!(store.list_by_template_name(7, "news").await.unwrap().len(), 1);
        assert_eq!(store.total(7).await.unwrap(), 3);
        assert_eq!(store.total(8).await.unwrap(), 0);
    }
}
