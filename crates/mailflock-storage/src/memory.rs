//! In-memory repositories
//!
//! [`MemoryStore`] implements every repository trait over one shared state
//! guarded by a single lock. Each operation takes the lock once and either
//! validates before it mutates or undoes its partial writes on failure, so a
//! failed call leaves nothing behind, the same as a rolled back transaction.

mod campaigns;
mod events;
mod queue;
mod scheduled;
mod metrics;
mod segments;
mod subscribers;

pub use queue::MemoryQueue;

use crate::models::{
    Bounce, Campaign, Click, Complaint, Delivery, Open, ScheduledCampaign, Segment, Subscriber,
    SubscriberMetrics,
};
use chrono::NaiveDate;
use mailflock_common::types::{CampaignId, SegmentId, SubscriberId, UserId};
use mailflock_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    last_id: i64,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    segments: BTreeMap<SegmentId, Segment>,
    /// `(subscriber_id, segment_id)` pairs
    memberships: BTreeSet<(SubscriberId, SegmentId)>,
    campaigns: BTreeMap<CampaignId, Campaign>,
    schedules: BTreeMap<CampaignId, ScheduledCampaign>,
    opens: Vec<Open>,
    clicks: Vec<Click>,
    bounces: Vec<Bounce>,
    complaints: Vec<Complaint>,
    deliveries: Vec<Delivery>,
    sends: Vec<(UserId, CampaignId)>,
    subscriber_metrics: BTreeMap<(UserId, NaiveDate), SubscriberMetrics>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn segment_count(&self, segment_id: SegmentId) -> i64 {
        self.memberships
            .iter()
            .filter(|(_, seg)| *seg == segment_id)
            .count() as i64
    }

    fn segment_with_count(&self, segment: &Segment) -> Segment {
        let mut segment = segment.clone();
        segment.subscribers_in_segment = self.segment_count(segment.id);
        segment
    }

    /// Segments of a subscriber, newest first
    fn segments_of(&self, subscriber_id: SubscriberId) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .memberships
            .iter()
            .filter(|(sub, _)| *sub == subscriber_id)
            .filter_map(|(_, seg)| self.segments.get(seg).cloned())
            .collect();
        segments.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        segments
    }

    fn segment_ids_of(&self, subscriber_id: SubscriberId) -> std::collections::HashSet<SegmentId> {
        self.memberships
            .iter()
            .filter(|(sub, _)| *sub == subscriber_id)
            .map(|(_, seg)| *seg)
            .collect()
    }

    fn with_segments(&self, subscriber: &Subscriber) -> Subscriber {
        let mut subscriber = subscriber.clone();
        subscriber.segments = self.segments_of(subscriber.id);
        subscriber
    }

    /// Check every id names one of the user's segments
    fn owned_segments(&self, user_id: UserId, ids: &[SegmentId]) -> Result<BTreeSet<SegmentId>> {
        let wanted: BTreeSet<SegmentId> = ids.iter().copied().collect();
        let missing = wanted
            .iter()
            .filter(|id| {
                self.segments
                    .get(id)
                    .map_or(true, |segment| segment.user_id != user_id)
            })
            .count();

        if missing > 0 {
            return Err(Error::NotFound(format!(
                "{} of {} segments not found",
                missing,
                wanted.len()
            )));
        }
        Ok(wanted)
    }
}

/// In-memory implementation of all repositories
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}
