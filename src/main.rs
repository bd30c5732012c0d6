//! MediStock API server: order intake, order reads and stock endpoints.
//! Fulfillment runs in the separate `medistock-worker` binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use medistock_api::cache::{CacheBackend, RedisCache, StockCache};
use medistock_api::config::{init_tracing, load_config};
use medistock_api::events::{self, EventSender};
use medistock_api::message_queue::{MessageQueue, RedisMessageQueue};
use medistock_api::search::{ElasticSearchIndex, InMemorySearchIndex, SearchIndex};
use medistock_api::services::orders::OrderService;
use medistock_api::services::stock::StockService;
use medistock_api::{app_router, db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    init_tracing(config.log_level(), config.log_json);

    info!(
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "starting medistock-api"
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
    tokio::spawn(events::process_events(event_receiver));

    let orders = Arc::new(OrderService::new(
        db.clone(),
        queue.clone(),
        event_sender.clone(),
        config.fulfillment_queue.clone(),
    ));
    let stock = Arc::new(StockService::new(
        db.clone(),
        stock_cache,
        search,
        event_sender.clone(),
    ));

    let state = AppState {
        db,
        config: Arc::new(config.clone()),
        event_sender,
        orders,
        stock,
    };

    let app = app_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors_layer(config.cors_allowed_origins.as_deref()));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

fn cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    match allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        _ => CorsLayer::permissive(),
    }
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
