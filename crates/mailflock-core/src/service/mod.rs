//! Services over the repositories
//!
//! Services validate caller input before it reaches storage and keep the
//! side records of a change, such as subscriber metrics, in step with it.

mod campaigns;
mod segments;
mod subscribers;

pub use campaigns::{CampaignService, SendCampaignRequest};
pub use segments::SegmentService;
pub use subscribers::SubscriberService;
