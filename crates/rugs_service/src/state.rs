//! Shared application state handed to the REST layer.

use std::sync::Arc;

use feed_rugs::FeedStatus;
use metrics_exporter_prometheus::PrometheusHandle;
use schema_registry::SchemaRegistry;
use storage_mongo::{MongoStore, StoreCounters};
use stream_hub::StreamHub;
use tokio::sync::Semaphore;

use crate::metrics::ServiceMetrics;

#[derive(Clone)]
pub struct AppState {
    pub store: MongoStore,
    pub registry: Arc<SchemaRegistry>,
    pub hub: Arc<StreamHub>,
    pub metrics: Arc<ServiceMetrics>,
    pub store_counters: Arc<StoreCounters>,
    pub feed_status: Arc<FeedStatus>,
    /// Bounds concurrent verifier runs behind POST /api/prng/verify.
    pub verify_limit: Arc<Semaphore>,
    pub prometheus: PrometheusHandle,
}
