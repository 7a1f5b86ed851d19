//! rugs-data-service entry point: config, store bootstrap, schema
//! compilation, task wiring, HTTP serve, cooperative shutdown. Only
//! startup failures propagate out of `main`; everything at runtime is
//! counted, logged, and survived.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use feed_rugs::{FeedConfig, FeedStatus, FrameBus, RugsFeed};
use game_tracker::GameTracker;
use schema_registry::SchemaRegistry;
use storage_mongo::{MongoConfig, MongoStore, StoreCounters, StorePool};
use stream_hub::StreamHub;
use tokio::sync::{watch, Semaphore};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod api;
mod config;
mod metrics;
mod router;
mod state;
#[cfg(test)]
mod tests;
mod verify;

use config::Config;
use metrics::ServiceMetrics;
use router::Pipeline;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = observability::init_tracing("rugs_service");
    install_rustls_provider();
    let config = Config::parse();
    let prometheus = observability::init_metrics();

    tracing::info!(
        listen = %config.listen_address,
        upstream = %config.upstream_url,
        "starting rugs-data-service"
    );

    // Fatal startup path: store and schemas must be usable before
    // anything is served.
    let mongo_config = MongoConfig {
        url: config.mongo_url.clone(),
        db_name: config.db_name.clone(),
        tick_ttl_days: config.tick_ttl_days,
    };
    let store = MongoStore::connect(&mongo_config).await?;
    store.ensure_indexes(&mongo_config).await?;
    let registry =
        Arc::new(SchemaRegistry::load(Path::new(&config.schema_dir)).context("load schemas")?);

    let metrics = Arc::new(ServiceMetrics::default());
    let hub = Arc::new(StreamHub::new(config.subscriber_buffer));
    let store_counters = Arc::new(StoreCounters::default());
    let sink: Arc<dyn core_types::StoreSink> = Arc::new(store.clone());
    let pool = Arc::new(StorePool::spawn(
        sink.clone(),
        store_counters.clone(),
        config.store_workers,
        config.store_queue,
    ));
    let feed_status = Arc::new(FeedStatus::default());
    let bus = FrameBus::new(config.frame_capacity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed_handle = spawn_feed(
        FeedConfig {
            upstream_url: config.upstream_url.clone(),
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            max_reconnects: config.max_reconnects,
        },
        feed_status.clone(),
        bus.clone(),
        sink.clone(),
        shutdown_rx.clone(),
    );
    let router_handle = spawn_router(
        registry.clone(),
        hub.clone(),
        pool.clone(),
        metrics.clone(),
        bus.clone(),
        shutdown_rx.clone(),
    );

    let heartbeat_handle = spawn_heartbeats(hub.clone(), shutdown_rx.clone());

    let app_state = AppState {
        store,
        registry,
        hub: hub.clone(),
        metrics,
        store_counters,
        feed_status,
        verify_limit: Arc::new(Semaphore::new(config.verifier_concurrency.max(1))),
        prometheus,
    };
    let app = api::build_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config));

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("bind {}", config.listen_address))?;
    tracing::info!(addr = %config.listen_address, "service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cooperative shutdown: stop the feed, drain router and store
    // queues under the deadline, then close subscribers.
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let drain = Duration::from_secs(config.drain_secs.max(1));
    let _ = tokio::time::timeout(drain, async {
        let _ = feed_handle.await;
        let _ = router_handle.await;
    })
    .await;
    heartbeat_handle.abort();
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown(drain).await,
        Err(_) => tracing::warn!("store pool still referenced at shutdown"),
    }
    hub.close_all();
    tracing::info!("bye");
    Ok(())
}

/// Task-boundary supervisor for the upstream consumer: a panic is
/// logged and the task restarts with a fresh session; the process
/// never goes down with it.
fn spawn_feed(
    config: FeedConfig,
    status: Arc<FeedStatus>,
    bus: FrameBus,
    sink: Arc<dyn core_types::StoreSink>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let feed = RugsFeed::new(config.clone(), status.clone(), bus.clone(), sink.clone());
            let run = tokio::spawn(feed.run(shutdown.clone()));
            match run.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    tracing::error!("feed task panicked; restarting");
                    if *shutdown.borrow() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

/// Same contract for the router. A restarted router begins untracked
/// and re-latches onto the next game start.
fn spawn_router(
    registry: Arc<SchemaRegistry>,
    hub: Arc<StreamHub>,
    pool: Arc<StorePool>,
    metrics: Arc<ServiceMetrics>,
    bus: FrameBus,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let pipeline = Pipeline {
                registry: registry.clone(),
                hub: hub.clone(),
                pool: pool.clone(),
                metrics: metrics.clone(),
                tracker: GameTracker::new(),
            };
            let run = tokio::spawn(pipeline.run(bus.subscribe(), shutdown.clone()));
            match run.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    tracing::error!("router task panicked; restarting");
                    if *shutdown.borrow() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
}

fn spawn_heartbeats(
    hub: Arc<StreamHub>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(stream_hub::HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => hub.send_heartbeats(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn cors_layer(config: &Config) -> CorsLayer {
    match config.cors_origin_list() {
        None => CorsLayer::permissive(),
        Some(origins) => {
            let parsed: Vec<axum::http::HeaderValue> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

fn install_rustls_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
