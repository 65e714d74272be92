//! Core services of the load balancer.

pub mod announce;
pub mod dispatch;
pub mod instance;
pub mod queue;
pub mod registry;
pub mod traffic;
pub mod watcher;

pub use announce::AnnounceSupervisor;
pub use dispatch::Dispatcher;
pub use instance::Instance;
pub use queue::{IngestQueue, PendingTorrent};
pub use registry::InstanceRegistry;
pub use traffic::TrafficProbe;
pub use watcher::TorrentWatcher;
