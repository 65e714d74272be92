//! Thin client for the qBittorrent Web API.
//!
//! Covers the handful of endpoints a supervisor needs: cookie login,
//! `sync/maindata`, `torrents/add`, `torrents/reannounce` and
//! `torrents/trackers`. Everything else the API offers is intentionally
//! out of scope.

mod client;
mod error;
mod models;

pub use client::{AddTorrentParams, Client};
pub use error::{Error, Result};
pub use models::{MainData, ServerState, TorrentEntry, Tracker, TrackerStatus};
