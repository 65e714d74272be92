//! Per-instance state for one qBittorrent daemon.

use std::sync::Arc;
use std::time::Instant;

use qbit_client::MainData;

use crate::config::InstanceConfig;

/// Outbound byte count published when the traffic meter reports the link as
/// throttled; large enough that any configured limit excludes the instance.
pub const THROTTLED_TRAFFIC_SENTINEL: u64 = 1_000_000_000;

/// Live state of one qBittorrent daemon.
///
/// Created once at startup from config and never destroyed. Metric fields
/// are written by the status worker only; the dispatch worker reads them and
/// bumps the placement counters. Reconnect tasks coordinate through
/// `reconnecting`.
#[derive(Clone, Debug)]
pub struct Instance {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Present whenever a login has succeeded; kept after a disconnect so
    /// the stale handle is simply replaced on reconnect.
    pub client: Option<Arc<qbit_client::Client>>,
    pub connected: bool,
    pub reconnecting: bool,
    pub upload_kbps: f64,
    pub download_kbps: f64,
    pub active_downloads: usize,
    pub free_space_bytes: i64,
    pub reserved_space_bytes: i64,
    /// Meter reading; 0 means unknown (treated as within limit).
    pub traffic_out_bytes: u64,
    /// 0 means unlimited.
    pub traffic_limit_bytes: u64,
    pub traffic_check_url: Option<String>,
    /// Placements accepted in the current dispatch pass; reset after each
    /// pass.
    pub new_tasks_this_round: u32,
    /// Placements accepted over the process lifetime.
    pub total_added_tasks: u64,
    /// Successful maindata snapshots; drives the traffic probe duty cycle.
    pub success_metrics_count: u64,
    /// Last status change or connection attempt.
    pub last_update: Instant,
}

impl Instance {
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            client: None,
            connected: false,
            reconnecting: false,
            upload_kbps: 0.0,
            download_kbps: 0.0,
            active_downloads: 0,
            free_space_bytes: 0,
            reserved_space_bytes: config.reserved_space_bytes(),
            traffic_out_bytes: 0,
            traffic_limit_bytes: config.traffic_limit_bytes(),
            traffic_check_url: config.traffic_check_url.clone(),
            new_tasks_this_round: 0,
            total_added_tasks: 0,
            success_metrics_count: 0,
            last_update: Instant::now(),
        }
    }

    /// Fold a maindata snapshot into the instance's derived metrics.
    pub fn apply_maindata(&mut self, maindata: &MainData) {
        self.upload_kbps = maindata.server_state.up_info_speed as f64 / 1024.0;
        self.download_kbps = maindata.server_state.dl_info_speed as f64 / 1024.0;
        self.free_space_bytes = maindata.server_state.free_space_on_disk;
        self.active_downloads = maindata
            .torrents
            .values()
            .filter(|t| t.state == "downloading")
            .count();
        self.success_metrics_count += 1;
        self.last_update = Instant::now();
    }

    /// Whether the traffic probe is due after this snapshot (every 30th
    /// success, and only for instances with a meter URL).
    pub fn traffic_probe_due(&self) -> bool {
        self.traffic_check_url.is_some() && self.success_metrics_count % 30 == 0
    }

    /// True when the meter reading does not rule this instance out.
    /// 0 bytes means "unknown" and is allowed; a limit of 0 means unlimited.
    pub fn traffic_within_limit(&self) -> bool {
        self.traffic_out_bytes == 0
            || self.traffic_limit_bytes == 0
            || self.traffic_out_bytes < self.traffic_limit_bytes
    }
}
