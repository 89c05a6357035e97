//! Mailflock Storage - Database access, pagination and report files
//!
//! Every repository comes in two flavours behind one trait: a PostgreSQL
//! implementation used by the server and an in-memory implementation with
//! the same ordering and tenant scoping, used by tests and tooling.

pub mod db;
pub mod memory;
pub mod models;
pub mod pagination;
pub mod report_storage;
pub mod repository;
pub mod topic_queue;

pub use db::DatabasePool;
pub use memory::{MemoryQueue, MemoryStore};
pub use models::*;
pub use pagination::{PageToken, Pagination, PaginationCursor, Resource, Scope, SegmentScan};
pub use report_storage::{LocalReportStorage, ReportStorage};
pub use repository::*;
pub use topic_queue::{MessageQueue, QueuedMessage, TopicQueue};
