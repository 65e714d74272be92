//! Test infrastructure for qbfleet integration tests.

use std::sync::Arc;

use axum_test::TestServer;

use qbfleet::api::{self, WebhookState};
use qbfleet::config::{Config, InstanceConfig, SortKey};
use qbfleet::services::{IngestQueue, InstanceRegistry};

/// Webhook server plus handles on the state behind it.
pub struct TestApp {
    pub server: TestServer,
    pub queue: Arc<IngestQueue>,
    pub registry: Arc<InstanceRegistry>,
}

/// Minimal configuration with one (never connected) instance.
pub fn test_config() -> Config {
    Config {
        qbittorrent_instances: vec![InstanceConfig {
            name: "qb1".to_string(),
            url: "http://127.0.0.1:8080".to_string(),
            username: "admin".to_string(),
            password: "adminadmin".to_string(),
            traffic_check_url: None,
            traffic_limit: None,
            reserved_space: None,
        }],
        max_new_tasks_per_instance: 2,
        primary_sort_key: SortKey::UploadSpeed,
        fast_announce_interval: 3.0,
        max_announce_retries: 12,
        reconnect_interval: 180,
        max_reconnect_attempts: 1,
        connection_timeout: 10,
        debug_add_stopped: false,
        webhook_port: 0,
        webhook_path: "/webhook".to_string(),
        log_dir: None,
        torrent_watch_dir: None,
        torrent_max_age_minutes: 30,
    }
}

impl TestApp {
    /// Build a webhook server over fresh state. No instance is connected;
    /// the handlers never reach out over the network.
    pub fn new() -> Self {
        Self::with_path("/webhook")
    }

    pub fn with_path(webhook_path: &str) -> Self {
        let config = Arc::new(test_config());
        let registry = InstanceRegistry::new_shared(config);
        let queue = Arc::new(IngestQueue::new());

        let state = WebhookState {
            queue: Arc::clone(&queue),
            registry: Arc::clone(&registry),
        };
        let server = TestServer::new(api::router(state, webhook_path))
            .expect("failed to start test server");

        Self {
            server,
            queue,
            registry,
        }
    }
}
