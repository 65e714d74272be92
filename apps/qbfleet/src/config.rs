//! Configuration for the qbfleet load balancer.
//!
//! Loads `config.json` with environment variable overrides.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigLoader, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};

use crate::error::AppError;

const MIB: u64 = 1024 * 1024;

/// Bounds for the fast announce interval, seconds.
const FAST_ANNOUNCE_MIN: f64 = 2.0;
const FAST_ANNOUNCE_MAX: f64 = 10.0;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The qBittorrent fleet to balance across. At least one entry.
    pub qbittorrent_instances: Vec<InstanceConfig>,
    /// Per-instance cap on placements within one dispatch pass.
    pub max_new_tasks_per_instance: u32,
    #[serde(default, deserialize_with = "deserialize_sort_key")]
    pub primary_sort_key: SortKey,
    /// Seconds between status ticks while torrents are under announce
    /// supervision; clamped to [2, 10].
    #[serde(default = "default_fast_announce_interval")]
    pub fast_announce_interval: f64,
    #[serde(default = "default_max_announce_retries")]
    pub max_announce_retries: u32,
    /// Seconds a disconnected instance waits before the next reconnect.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Per-request timeout for the qBittorrent API, seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Add torrents in stopped state (debugging aid).
    #[serde(default)]
    pub debug_add_stopped: bool,
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// When set, logs are also written to a file in this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// When set, `.torrent` files dropped here are ingested as well.
    #[serde(default)]
    pub torrent_watch_dir: Option<PathBuf>,
    /// Watched files older than this are rejected or deleted.
    #[serde(default = "default_torrent_max_age_minutes")]
    pub torrent_max_age_minutes: u64,
}

/// One qBittorrent daemon.
#[derive(Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    /// Out-of-band traffic meter endpoint; never probed when absent.
    #[serde(default)]
    pub traffic_check_url: Option<String>,
    /// Monthly outbound budget in MiB; 0/absent means unlimited.
    #[serde(default)]
    pub traffic_limit: Option<u64>,
    /// Free-space floor in MiB below which no new torrents are placed.
    #[serde(default)]
    pub reserved_space: Option<u64>,
}

// Custom Debug implementation to avoid exposing password
impl std::fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("traffic_check_url", &self.traffic_check_url)
            .field("traffic_limit", &self.traffic_limit)
            .field("reserved_space", &self.reserved_space)
            .finish()
    }
}

impl InstanceConfig {
    pub fn reserved_space_bytes(&self) -> i64 {
        (self.reserved_space.unwrap_or(0) * MIB) as i64
    }

    pub fn traffic_limit_bytes(&self) -> u64 {
        self.traffic_limit.unwrap_or(0) * MIB
    }
}

/// Primary ordering factor for instance selection; smallest wins for all
/// three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    UploadSpeed,
    DownloadSpeed,
    ActiveDownloads,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::UploadSpeed => "upload_speed",
            SortKey::DownloadSpeed => "download_speed",
            SortKey::ActiveDownloads => "active_downloads",
        }
    }
}

/// An unrecognized sort key falls back to upload speed rather than failing
/// the whole config.
fn deserialize_sort_key<'de, D>(deserializer: D) -> Result<SortKey, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.as_str() {
        "upload_speed" => Ok(SortKey::UploadSpeed),
        "download_speed" => Ok(SortKey::DownloadSpeed),
        "active_downloads" => Ok(SortKey::ActiveDownloads),
        other => {
            tracing::warn!(
                sort_key = %other,
                "unsupported primary_sort_key, falling back to upload_speed"
            );
            Ok(SortKey::UploadSpeed)
        }
    }
}

fn default_fast_announce_interval() -> f64 {
    3.0
}

fn default_max_announce_retries() -> u32 {
    12
}

fn default_reconnect_interval() -> u64 {
    180
}

fn default_max_reconnect_attempts() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_webhook_port() -> u16 {
    5000
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

fn default_torrent_max_age_minutes() -> u64 {
    30
}

impl Config {
    /// Load configuration from `config.json` in the working directory.
    pub fn load() -> Result<Self, AppError> {
        Self::load_from("config.json")
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables with a `QBFLEET_` prefix override file values,
    /// using double underscore for nesting: `QBFLEET_WEBHOOK_PORT=8080`.
    pub fn load_from(config_path: &str) -> Result<Self, AppError> {
        let loader = ConfigLoader::builder()
            .add_source(File::new(config_path, FileFormat::Json))
            .add_source(
                Environment::with_prefix("QBFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = loader.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&mut self) -> Result<(), AppError> {
        if self.qbittorrent_instances.is_empty() {
            return Err(AppError::Internal(
                "config lists no qbittorrent_instances".to_string(),
            ));
        }

        if self.fast_announce_interval < FAST_ANNOUNCE_MIN
            || self.fast_announce_interval > FAST_ANNOUNCE_MAX
        {
            let clamped = self
                .fast_announce_interval
                .clamp(FAST_ANNOUNCE_MIN, FAST_ANNOUNCE_MAX);
            tracing::warn!(
                configured = self.fast_announce_interval,
                clamped,
                "fast_announce_interval out of range, clamping"
            );
            self.fast_announce_interval = clamped;
        }

        if !self.webhook_path.starts_with('/') {
            self.webhook_path = format!("/{}", self.webhook_path);
        }

        Ok(())
    }

    pub fn fast_announce_duration(&self) -> Duration {
        Duration::from_secs_f64(self.fast_announce_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn torrent_max_age(&self) -> Duration {
        Duration::from_secs(self.torrent_max_age_minutes * 60)
    }

    /// Socket address for the webhook server, all interfaces.
    pub fn webhook_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new("0.0.0.0".parse().expect("static IP"), self.webhook_port)
    }
}
