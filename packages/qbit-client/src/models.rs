//! Response models for the subset of the qBittorrent Web API this client
//! consumes.
//!
//! Only the fields the caller actually reads are deserialized; everything
//! else the daemon sends is ignored.

use std::collections::HashMap;

use serde::Deserialize;
use serde_repr::Deserialize_repr;

/// Response of `/api/v2/sync/maindata`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MainData {
    /// Response ID, echoed back on incremental syncs.
    #[serde(default)]
    pub rid: i64,
    #[serde(default)]
    pub full_update: Option<bool>,
    /// Torrents keyed by info-hash.
    #[serde(default)]
    pub torrents: HashMap<String, TorrentEntry>,
    /// Global transfer statistics and disk state.
    #[serde(default)]
    pub server_state: ServerState,
}

/// Global daemon state carried inside a maindata response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerState {
    /// Current upload speed in bytes/s.
    #[serde(default)]
    pub up_info_speed: i64,
    /// Current download speed in bytes/s.
    #[serde(default)]
    pub dl_info_speed: i64,
    /// Free space on the default save path, bytes.
    #[serde(default)]
    pub free_space_on_disk: i64,
}

/// Per-torrent record inside a maindata response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TorrentEntry {
    #[serde(default)]
    pub name: String,
    /// Unix epoch seconds when the torrent was added.
    #[serde(default)]
    pub added_on: i64,
    /// Raw daemon state string, e.g. `downloading`, `stalledDL`, `uploading`.
    #[serde(default)]
    pub state: String,
    /// Completion in `[0.0, 1.0]`.
    #[serde(default)]
    pub progress: f64,
    /// Connected leechers.
    #[serde(default)]
    pub num_leechs: i64,
}

/// Tracker contact state as reported by `/api/v2/torrents/trackers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr)]
#[repr(i64)]
pub enum TrackerStatus {
    Disabled = 0,
    NotContacted = 1,
    Working = 2,
    Updating = 3,
    NotWorking = 4,
}

impl Default for TrackerStatus {
    fn default() -> Self {
        TrackerStatus::NotContacted
    }
}

/// One entry of `/api/v2/torrents/trackers`.
///
/// The daemon lists DHT/PeX/LSD as pseudo-trackers with `tier < 0`.
#[derive(Debug, Clone, Deserialize)]
pub struct Tracker {
    pub url: String,
    #[serde(default)]
    pub status: TrackerStatus,
    #[serde(default)]
    pub tier: i64,
    /// Tracker message; error text when the announce failed.
    #[serde(default)]
    pub msg: String,
}
