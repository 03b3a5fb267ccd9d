//! Environment-driven service configuration.

use std::path::PathBuf;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub kv_path: PathBuf,
    pub search_index_url: String,
    pub search_index_key: Option<String>,
    pub icon_dir: PathBuf,
    pub bind_addr: String,
    pub sync_interval: Duration,
    pub sync_on_start: bool,
    /// `SYNC_PROVIDER`: restrict scheduled syncs to one vendor slug.
    pub sync_provider: Option<String>,
    pub price_fanout_concurrency: usize,
    pub price_requests_per_minute: u32,
    pub known_bad_icon_hashes: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: PathBuf::from(env_or("DATABASE_PATH", "data/numbroker.db")),
            kv_path: PathBuf::from(env_or("KV_PATH", "data/kv.db")),
            search_index_url: env_or("SEARCH_INDEX_URL", "http://127.0.0.1:7700"),
            search_index_key: std::env::var("SEARCH_INDEX_KEY").ok().filter(|k| !k.is_empty()),
            icon_dir: PathBuf::from(env_or("ICON_DIR", "data/icons")),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            sync_interval: Duration::from_secs(env_parse("SYNC_INTERVAL_HOURS", 12u64) * 3600),
            sync_on_start: env_flag("SYNC_ON_START", false),
            sync_provider: std::env::var("SYNC_PROVIDER").ok().filter(|v| !v.is_empty()),
            price_fanout_concurrency: env_parse("SYNC_MAX_IN_FLIGHT", 50usize),
            price_requests_per_minute: env_parse("SYNC_REQUESTS_PER_MINUTE", 180u32),
            known_bad_icon_hashes: std::env::var("BAD_ICON_HASHES")
                .map(|raw| {
                    raw.split(',')
                        .map(|h| h.trim().to_lowercase())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}
