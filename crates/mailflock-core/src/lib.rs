//! Mailflock Core - Campaign dispatch and the services around it
//!
//! The dispatch protocol turns a `campaigns` message into `send_bulk`
//! batches. Validated services over the repositories, unsubscribe links and
//! report exports live alongside it.

pub mod dispatch;
pub mod export;
pub mod publisher;
pub mod service;
pub mod unsubscribe;
pub mod validation;

pub use dispatch::{
    CampaignDispatcher, Campaigner, DispatchReport, ScheduledCampaignPoller, SendCampaignParams,
};
pub use export::{request_export, ExportRequest, ExportWorker, Exporter, ExporterRegistry};
pub use publisher::{publish_json, Publisher};
pub use service::{CampaignService, SegmentService, SendCampaignRequest, SubscriberService};
pub use unsubscribe::{unsubscribe, UnsubscribeSigner};
