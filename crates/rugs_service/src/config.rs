//! Service configuration. Everything arrives as flags or environment
//! variables; the two store settings are required and missing them is a
//! fatal startup error (clap exits non-zero before anything is served).

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rugs-data-service",
    version,
    about = "Read-only game feed ingest / validate / persist / broadcast service"
)]
pub struct Config {
    /// Document store connection string.
    #[arg(long, env = "MONGO_URL")]
    pub mongo_url: String,

    /// Logical database name.
    #[arg(long, env = "DB_NAME")]
    pub db_name: String,

    /// Upstream socket URL; the query string is preserved on the wire.
    #[arg(
        long,
        env = "RUGS_UPSTREAM_URL",
        default_value = feed_rugs::DEFAULT_UPSTREAM_URL
    )]
    pub upstream_url: String,

    /// Comma-separated allowed origins, or `*`.
    #[arg(long, env = "CORS_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:8001")]
    pub listen_address: String,

    /// Directory holding the canonical JSON Schemas.
    #[arg(long, env = "SCHEMA_DIR", default_value = "schemas")]
    pub schema_dir: String,

    /// Raw-frame ring capacity; overflow drops oldest and is counted.
    #[arg(long, env = "RUGS_FRAME_CAPACITY", default_value_t = 16_384)]
    pub frame_capacity: usize,

    /// Per-subscriber outbound buffer depth.
    #[arg(long, env = "RUGS_SUBSCRIBER_BUFFER", default_value_t = 64)]
    pub subscriber_buffer: usize,

    #[arg(long, env = "RUGS_STORE_WORKERS", default_value_t = 4)]
    pub store_workers: usize,

    #[arg(long, env = "RUGS_STORE_QUEUE", default_value_t = 4_096)]
    pub store_queue: usize,

    /// Upstream reconnect attempt cap; 0 retries forever.
    #[arg(long, env = "RUGS_MAX_RECONNECTS", default_value_t = 0)]
    pub max_reconnects: u32,

    /// TTL for game_ticks / game_indices in days; 0 keeps them forever.
    #[arg(long, env = "RUGS_TICK_TTL_DAYS", default_value_t = 0)]
    pub tick_ttl_days: u64,

    /// Concurrent verifier runs serviced by POST /api/prng/verify.
    #[arg(long, env = "RUGS_VERIFIER_CONCURRENCY", default_value_t = 2)]
    pub verifier_concurrency: usize,

    /// Queue drain budget on shutdown, seconds.
    #[arg(long, env = "RUGS_SHUTDOWN_DRAIN_SECS", default_value_t = 10)]
    pub drain_secs: u64,
}

impl Config {
    pub fn cors_origin_list(&self) -> Option<Vec<String>> {
        if self.cors_origins.trim() == "*" {
            return None;
        }
        Some(
            self.cors_origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}
