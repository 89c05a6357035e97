//! Report exporters
//!
//! Exporters are looked up by resource tag in an [`ExporterRegistry`]. A tag
//! with no exporter resolves to one that fails with `NotFound`, so callers
//! never special-case missing entries. Export requests travel over the
//! `exports` topic and are run by [`ExportWorker`].

use crate::publisher::{publish_json, Publisher};
use async_trait::async_trait;
use chrono::Utc;
use mailflock_common::types::UserId;
use mailflock_common::{Error, Result};
use mailflock_storage::pagination::MAX_PER_PAGE;
use mailflock_storage::report_storage::report_path;
use mailflock_storage::{
    MessageQueue, PageToken, Report, ReportStorage, Resource, SubscriberRepository,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration as TokioDuration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Writes one resource of a user to report storage
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, user_id: UserId, cancel: &CancellationToken) -> Result<Report>;
}

/// Stand-in for tags without an exporter
pub struct UnknownExporter {
    resource: String,
}

#[async_trait]
impl Exporter for UnknownExporter {
    async fn export(&self, _user_id: UserId, _cancel: &CancellationToken) -> Result<Report> {
        Err(Error::NotFound(format!(
            "No exporter for resource {}",
            self.resource
        )))
    }
}

/// Resource tag to exporter
#[derive(Default, Clone)]
pub struct ExporterRegistry {
    exporters: HashMap<String, Arc<dyn Exporter>>,
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `subscribers` exporter
    pub fn with_defaults(
        subscribers: Arc<dyn SubscriberRepository>,
        storage: Arc<dyn ReportStorage>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            Resource::Subscribers.to_string(),
            Arc::new(SubscriberExporter::new(subscribers, storage)),
        );
        registry
    }

    pub fn register(&mut self, resource: impl Into<String>, exporter: Arc<dyn Exporter>) {
        self.exporters.insert(resource.into(), exporter);
    }

    pub fn resolve(&self, resource: &str) -> Arc<dyn Exporter> {
        match self.exporters.get(resource) {
            Some(exporter) => Arc::clone(exporter),
            None => Arc::new(UnknownExporter {
                resource: resource.to_string(),
            }),
        }
    }
}

#[derive(Serialize)]
struct SubscriberRow<'a> {
    id: i64,
    name: &'a str,
    email: &'a str,
    active: bool,
    blacklisted: bool,
    metadata: String,
    created_at: String,
}

/// CSV of every subscriber of a user
pub struct SubscriberExporter {
    subscribers: Arc<dyn SubscriberRepository>,
    storage: Arc<dyn ReportStorage>,
}

impl SubscriberExporter {
    pub fn new(subscribers: Arc<dyn SubscriberRepository>, storage: Arc<dyn ReportStorage>) -> Self {
        Self {
            subscribers,
            storage,
        }
    }
}

fn csv_error(e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("Failed to write CSV: {}", e))
}

#[async_trait]
impl Exporter for SubscriberExporter {
    async fn export(&self, user_id: UserId, cancel: &CancellationToken) -> Result<Report> {
        let started = Utc::now();
        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut after = None;
        let mut rows = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let batch = self
                .subscribers
                .list_after(user_id, after, MAX_PER_PAGE)
                .await?;
            for s in &batch {
                writer
                    .serialize(SubscriberRow {
                        id: s.id,
                        name: &s.name,
                        email: &s.email,
                        active: s.active,
                        blacklisted: s.blacklisted,
                        metadata: serde_json::to_string(&s.metadata.0).map_err(csv_error)?,
                        created_at: s.created_at.to_rfc3339(),
                    })
                    .map_err(csv_error)?;
                rows += 1;
            }

            match batch.last() {
                Some(last) if batch.len() as i64 == MAX_PER_PAGE => {
                    after = Some(PageToken::of(last))
                }
                _ => break,
            }
        }

        if rows == 0 {
            writer
                .write_record(["id", "name", "email", "active", "blacklisted", "metadata", "created_at"])
                .map_err(csv_error)?;
        }
        let data = writer.into_inner().map_err(csv_error)?;

        let file_name = self
            .storage
            .store(&report_path(user_id, "subscribers", started), &data)
            .await?;

        info!(user_id, rows, file_name = %file_name, "Exported subscribers");
        Ok(Report {
            resource: Resource::Subscribers.to_string(),
            user_id,
            file_name,
            rows,
            created_at: started,
        })
    }
}

/// Request carried on the `exports` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub user_id: UserId,
    pub resource: String,
}

/// Queue an export of `resource` for `user_id`
pub async fn request_export(
    publisher: &dyn Publisher,
    topic: &str,
    user_id: UserId,
    resource: &str,
) -> Result<Uuid> {
    publish_json(
        publisher,
        topic,
        &ExportRequest {
            user_id,
            resource: resource.to_string(),
        },
    )
    .await
}

/// Consumer of the `exports` topic
pub struct ExportWorker {
    queue: Arc<dyn MessageQueue>,
    registry: ExporterRegistry,
    topic: String,
    poll_interval_secs: u64,
}

impl ExportWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        registry: ExporterRegistry,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            registry,
            topic: topic.into(),
            poll_interval_secs: 5,
        }
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs.max(1);
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(topic = %self.topic, "Export worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let idle = match self.process_next(&cancel).await {
                Ok(handled) => !handled,
                Err(e) => {
                    error!("Error consuming {}: {}", self.topic, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(TokioDuration::from_secs(self.poll_interval_secs)) => {}
                }
            }
        }

        info!(topic = %self.topic, "Export worker stopped");
    }

    /// Run the next export request. Returns false when the topic is empty.
    pub async fn process_next(&self, cancel: &CancellationToken) -> Result<bool> {
        let Some(message) = self.queue.claim(&self.topic).await? else {
            return Ok(false);
        };

        let request: ExportRequest = match serde_json::from_value(message.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                error!(message_id = %message.id, "Dropping undecodable export request: {}", e);
                self.queue.ack(message.id).await?;
                return Ok(true);
            }
        };
        debug!(user_id = request.user_id, resource = %request.resource, "Running export");

        let exporter = self.registry.resolve(&request.resource);
        match exporter.export(request.user_id, cancel).await {
            Ok(_) => self.queue.ack(message.id).await?,
            Err(e) if e.is_retryable() || matches!(e, Error::Cancelled) => {
                self.queue
                    .release(message.id, &e.to_string(), chrono::Duration::minutes(1))
                    .await?
            }
            Err(e) => {
                warn!(
                    user_id = request.user_id,
                    resource = %request.resource,
                    "Export failed: {}",
                    e
                );
                self.queue.ack(message.id).await?;
            }
        }
        Ok(true)
    }
}
