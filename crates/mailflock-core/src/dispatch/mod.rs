//! Campaign dispatch protocol
//!
//! `campaigns` topic -> [`Campaigner`] -> [`CampaignDispatcher`] -> `send_bulk`
//! topic. Due schedules enter the same path through [`ScheduledCampaignPoller`].

mod campaigner;
mod dispatcher;
mod message;
mod scheduler;

pub use campaigner::Campaigner;
pub use dispatcher::{BatchOutcome, CampaignDispatcher, DispatchReport};
pub use message::{
    BulkEmailDestination, BulkSendMessage, BulkTemplatedEmailInput, Destination, MessageTag,
    SendCampaignParams, SesKeys,
};
pub use scheduler::ScheduledCampaignPoller;

#[cfg(test)]
pub(crate) mod test_support {
    use super::{SendCampaignParams, SesKeys};
    use crate::unsubscribe::UnsubscribeSigner;
    use chrono::{Duration, Utc};
    use mailflock_common::config::UnsubscribeConfig;
    use mailflock_storage::{
        CampaignRepository, CreateCampaign, CreateSegment, CreateSubscriber, MemoryStore,
        SegmentRepository,
    };
    use std::collections::BTreeMap;

    pub fn signer() -> UnsubscribeSigner {
        UnsubscribeSigner::new(&UnsubscribeConfig {
            secret: "s3cret".to_string(),
            app_url: "https://app.example.com".to_string(),
        })
    }

    /// Store with one segment of `members` eligible subscribers, created an
    /// hour ago, and a draft campaign for user 7
    pub async fn seeded(members: usize) -> (MemoryStore, SendCampaignParams) {
        let store = MemoryStore::new();
        let segment = SegmentRepository::create(
            &store,
            CreateSegment {
                user_id: 7,
                name: "everyone".to_string(),
            },
        )
        .await
        .unwrap();

        let base = Utc::now() - Duration::hours(1);
        for i in 0..members {
            store
                .insert_subscriber_at(
                    CreateSubscriber {
                        user_id: 7,
                        name: format!("Member {}", i),
                        email: format!("member{}@example.com", i),
                        metadata: BTreeMap::from([("plan".to_string(), "pro".to_string())]),
                        segment_ids: vec![segment.id],
                    },
                    base + Duration::milliseconds((i / 3) as i64),
                )
                .await
                .unwrap();
        }

        let campaign = CampaignRepository::create(
            &store,
            CreateCampaign {
                user_id: 7,
                name: "launch".to_string(),
                template_name: "welcome".to_string(),
            },
        )
        .await
        .unwrap();

        let params = SendCampaignParams {
            segment_ids: vec![segment.id],
            template_data: BTreeMap::from([("company".to_string(), "Acme".to_string())]),
            source: "Acme <news@acme.example>".to_string(),
            user_id: 7,
            user_uuid: "u-1".to_string(),
            configuration_set_exists: false,
            campaign,
            ses_keys: Some(SesKeys {
                access_key: "AKIA".to_string(),
                secret_key: "secret".to_string(),
                region: "eu-west-1".to_string(),
            }),
        };
        (store, params)
    }
}
