//! MediStock fulfillment worker: consumes the fulfillment queue, settles
//! orders against the stock ledger, and runs the reconciliation sweep for
//! stuck pending orders. Deployed separately from the API server so queue
//! depth and HTTP load scale independently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use medistock_api::cache::{CacheBackend, RedisCache, StockCache};
use medistock_api::config::{init_tracing, load_config};
use medistock_api::db;
use medistock_api::events::{self, EventSender};
use medistock_api::message_queue::{MessageQueue, RedisMessageQueue};
use medistock_api::search::{ElasticSearchIndex, InMemorySearchIndex, SearchIndex};
use medistock_api::services::fulfillment::FulfillmentWorker;
use medistock_api::services::reconciliation::ReconciliationSweep;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    init_tracing(config.log_level(), config.log_json);

    info!(
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "starting medistock-worker"
    );

    let db = Arc::new(
        db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?,
    );

    if config.auto_migrate {
        db::run_migrations(&db)
            .await
            .context("failed to run migrations")?;
    }

    let redis_client =
        Arc::new(redis::Client::open(config.redis_url.as_str()).context("invalid redis url")?);

    let queue: Arc<dyn MessageQueue> = Arc::new(
        RedisMessageQueue::new(
            redis_client.clone(),
            config.message_queue_namespace.clone(),
            Duration::from_secs(config.message_queue_block_timeout_secs),
            Duration::from_secs(config.message_queue_publish_timeout_secs),
        )
        .await
        .context("failed to connect message queue")?,
    );

    let cache_backend: Arc<dyn CacheBackend> = Arc::new(
        RedisCache::new(redis_client.clone())
            .await
            .context("failed to connect cache")?,
    );
    let stock_cache = StockCache::new(
        cache_backend,
        Duration::from_secs(config.stock_cache_ttl_secs),
    );

    let search: Arc<dyn SearchIndex> = match &config.search_url {
        Some(url) if !url.is_empty() => Arc::new(ElasticSearchIndex::new(
            url.clone(),
            config.search_index.clone(),
            Duration::from_secs(config.search_timeout_secs),
        )?),
        _ => {
            warn!("no search backend configured; medicine index updates are dropped");
            Arc::new(InMemorySearchIndex::new())
        }
    };

    let (event_sender, event_receiver) = EventSender::channel(1024);
    let event_processor = tokio::spawn(events::process_events(event_receiver));

    let worker = FulfillmentWorker::new(
        db.clone(),
        queue.clone(),
        stock_cache,
        search,
        event_sender.clone(),
        config.fulfillment_queue.clone(),
    );
    let sweep = ReconciliationSweep::new(
        db,
        queue,
        config.fulfillment_queue.clone(),
        Duration::from_secs(config.pending_requeue_threshold_secs),
        Duration::from_secs(config.pending_sweep_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { worker.run(shutdown).await }
    });
    let sweep_handle = tokio::spawn(async move { sweep.run(shutdown_rx).await });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let _ = worker_handle.await;
    let _ = sweep_handle.await;

    // Dropping the last sender drains the event loop.
    drop(event_sender);
    let _ = event_processor.await;

    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
