//! qbfleet — load balancer for a fleet of qBittorrent instances.
//!
//! Release notifications arrive over a webhook (or a watched directory),
//! land in a deduplicated queue, and are dispatched to the least-loaded
//! connected instance. Freshly added torrents are supervised for their
//! first two minutes and re-announced when trackers misbehave.
//!
//! This library exposes the modules for use in integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod workers;
