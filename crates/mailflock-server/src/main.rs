//! Mailflock - Campaign worker entry point

use anyhow::Result;
use mailflock_common::config::{Config, LoggingConfig};
use mailflock_core::{
    CampaignDispatcher, Campaigner, ExportWorker, ExporterRegistry, ScheduledCampaignPoller,
    UnsubscribeSigner,
};
use mailflock_storage::{
    DatabasePool, DbCampaignRepository, DbScheduledCampaignRepository, DbSubscriberRepository,
    LocalReportStorage, TopicQueue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting Mailflock worker...");

    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;
    info!("Database migrations completed");

    let subscribers = Arc::new(DbSubscriberRepository::new(db_pool.clone()));
    let campaigns = Arc::new(DbCampaignRepository::new(db_pool.clone()));
    let schedules = Arc::new(DbScheduledCampaignRepository::new(db_pool.clone()));
    let queue = Arc::new(TopicQueue::new(db_pool.clone()));
    let reports = Arc::new(LocalReportStorage::new(&config.reports)?);

    if config.unsubscribe.secret.is_empty() {
        warn!("unsubscribe.secret is empty; campaigns cannot be sent");
    }

    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Campaigner
    {
        let dispatcher = CampaignDispatcher::new(
            subscribers.clone(),
            campaigns.clone(),
            queue.clone(),
            UnsubscribeSigner::new(&config.unsubscribe),
            config.topics.send_bulk.clone(),
        )
        .with_config(&config.dispatch);
        let campaigner = Campaigner::new(queue.clone(), dispatcher, config.topics.campaigns.clone())
            .with_poll_interval(config.dispatch.poll_interval_secs)
            .with_renew_interval(Duration::from_secs(config.dispatch.lease_renew_secs));
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { campaigner.run(cancel).await }));
    }

    // Scheduled campaign poller
    if config.scheduler.enabled {
        let poller = ScheduledCampaignPoller::new(
            schedules,
            campaigns,
            queue.clone(),
            config.topics.campaigns.clone(),
        )
        .with_config(&config.scheduler)
        .with_configuration_set(config.dispatch.configuration_set.is_some());
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { poller.run(cancel).await }));
    } else {
        info!("Scheduled campaign poller disabled");
    }

    // Report exporter
    {
        let worker = ExportWorker::new(
            queue,
            ExporterRegistry::with_defaults(subscribers, reports),
            config.topics.exports.clone(),
        );
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(cancel).await }));
    }

    info!("Mailflock worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task failed: {}", e);
        }
    }

    info!("Mailflock worker shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailflock=debug", config.level)));

    let (text, json) = if config.format == "json" {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true).with_level(true)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}
