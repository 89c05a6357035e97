//! Database models

use crate::pagination::PageToken;
use chrono::{DateTime, NaiveDate, Utc};
use mailflock_common::types::{CampaignId, EventId, SegmentId, SubscriberId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Free-form string metadata persisted as a JSON column
pub type Metadata = BTreeMap<String, String>;

/// Subscriber model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub metadata: Json<Metadata>,
    pub active: bool,
    pub blacklisted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Segments the subscriber belongs to; only populated by single-row reads
    #[sqlx(skip)]
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Subscriber {
    /// Whether a campaign may be sent to this subscriber
    pub fn is_eligible(&self) -> bool {
        self.active && !self.blacklisted
    }
}

/// Create subscriber input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriber {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub segment_ids: Vec<SegmentId>,
}

/// Update subscriber input. `segment_ids` replaces the full membership set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSubscriber {
    pub name: String,
    pub metadata: Metadata,
    pub active: bool,
    pub segment_ids: Vec<SegmentId>,
}

/// Segment model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub user_id: UserId,
    pub name: String,
    /// Member count; zero unless the query selects it
    #[sqlx(default)]
    #[serde(default)]
    pub subscribers_in_segment: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create segment input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSegment {
    pub user_id: UserId,
    pub name: String,
}

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
}

impl CampaignStatus {
    /// Statuses a campaign may be in for a move to `self` to be accepted.
    ///
    /// `sending -> sending` is allowed so a failed dispatch can be retried;
    /// nothing leaves `sent`.
    pub fn allowed_from(self) -> &'static [CampaignStatus] {
        match self {
            CampaignStatus::Draft => &[CampaignStatus::Scheduled],
            CampaignStatus::Scheduled => &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            CampaignStatus::Sending => &[
                CampaignStatus::Draft,
                CampaignStatus::Scheduled,
                CampaignStatus::Sending,
            ],
            CampaignStatus::Sent => &[CampaignStatus::Sending],
        }
    }

    /// Whether a campaign in `self` may move to `next`
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        next.allowed_from().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    pub template_name: String,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Resume point of an interrupted dispatch; only set while `sending`
    #[serde(default)]
    pub dispatch_progress: Option<Json<DispatchProgress>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }
}

/// How far a dispatch got: the recipient snapshot it scans and the last
/// recipient of the longest run of published batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchProgress {
    pub snapshot_at: DateTime<Utc>,
    pub after: Option<PageToken>,
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub user_id: UserId,
    pub name: String,
    pub template_name: String,
}

/// Update campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCampaign {
    pub name: String,
    pub template_name: String,
}

/// Timer record that fires a campaign send at `scheduled_at`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledCampaign {
    pub id: Uuid,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    /// Public account id placed in unsubscribe links
    pub user_uuid: String,
    pub scheduled_at: DateTime<Utc>,
    pub source: String,
    pub segment_ids: Json<Vec<SegmentId>>,
    pub template_data: Json<BTreeMap<String, String>>,
    /// Set while a poller holds the schedule; expired claims are taken again
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert input for a campaign schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCampaign {
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub user_uuid: String,
    pub scheduled_at: DateTime<Utc>,
    pub source: String,
    pub segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub template_data: BTreeMap<String, String>,
}

/// Open event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Open {
    pub id: EventId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    pub user_agent: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
}

/// Click event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Click {
    pub id: EventId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub link: String,
    pub recipient: String,
    pub user_agent: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
}

/// Bounce event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Bounce {
    pub id: EventId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub bounce_type: String,
    pub sub_type: String,
    pub action: String,
    pub status: String,
    pub diagnostic_code: String,
    pub feedback_id: String,
    pub created_at: DateTime<Utc>,
}

/// Complaint event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Complaint {
    pub id: EventId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    pub user_agent: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub complaint_type: String,
    pub feedback_id: String,
    pub created_at: DateTime<Utc>,
}

/// Delivery event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Delivery {
    pub id: EventId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    pub processing_time_millis: i64,
    pub smtp_response: String,
    pub reporting_mta: String,
    pub remote_mta_ip: String,
    pub created_at: DateTime<Utc>,
}

/// Open totals for a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpensStats {
    pub unique: i64,
    pub total: i64,
}

/// Click totals for a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClicksStats {
    pub unique: i64,
    pub total: i64,
}

/// Aggregated event counters for one campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub opens: OpensStats,
    pub clicks: ClicksStats,
    pub total_sent: i64,
    pub delivered: i64,
    pub bounces: i64,
    pub complaints: i64,
}

/// Daily subscriber counters of one user
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriberMetrics {
    pub id: i64,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub created: i64,
    pub deleted: i64,
    pub unsubscribed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Amounts added to a day's subscriber counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsDelta {
    pub created: i64,
    pub deleted: i64,
    pub unsubscribed: i64,
}

impl MetricsDelta {
    pub fn created(n: i64) -> Self {
        Self {
            created: n,
            ..Self::default()
        }
    }

    pub fn deleted(n: i64) -> Self {
        Self {
            deleted: n,
            ..Self::default()
        }
    }

    pub fn unsubscribed(n: i64) -> Self {
        Self {
            unsubscribed: n,
            ..Self::default()
        }
    }
}

/// Exported report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub resource: String,
    pub user_id: UserId,
    pub file_name: String,
    pub rows: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_status_roundtrip() {
        for status in [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Sending,
            CampaignStatus::Sent,
        ] {
            assert_eq!(status.to_string().parse::<CampaignStatus>(), Ok(status));
        }
        assert!("paused".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn test_campaign_status_transitions() {
        use CampaignStatus::*;

        assert!(Draft.can_transition_to(Sending));
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Sending));
        assert!(Scheduled.can_transition_to(Draft));
        assert!(Sending.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));

        assert!(!Sending.can_transition_to(Draft));
        assert!(!Draft.can_transition_to(Sent));
        for next in [Draft, Scheduled, Sending, Sent] {
            assert!(!Sent.can_transition_to(next));
        }
    }
}
