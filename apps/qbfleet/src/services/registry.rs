//! Instance registry and health supervision.
//!
//! Owns every [`Instance`] record behind a single mutex. The status worker
//! drives [`InstanceRegistry::status_tick`] and
//! [`InstanceRegistry::check_and_schedule_reconnects`]; the dispatch worker
//! only reads metrics and bumps placement counters. The mutex is never held
//! across HTTP I/O: callers copy what they need, drop the lock, do the call,
//! and reacquire briefly to publish results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use qbit_client::{Client, MainData};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::services::announce::AnnounceSupervisor;
use crate::services::instance::Instance;
use crate::services::traffic::TrafficProbe;

/// Pause before the single snapshot retry.
const SNAPSHOT_RETRY_PAUSE: Duration = Duration::from_secs(5);
/// Pause between login attempts inside one reconnect task.
const RECONNECT_ATTEMPT_PAUSE: Duration = Duration::from_secs(2);

/// Concurrent set of instance records plus their health supervision.
pub struct InstanceRegistry {
    instances: Mutex<Vec<Instance>>,
    config: Arc<Config>,
    probe: TrafficProbe,
}

impl InstanceRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        let instances = config
            .qbittorrent_instances
            .iter()
            .map(Instance::from_config)
            .collect();
        Self {
            instances: Mutex::new(instances),
            config,
            probe: TrafficProbe::new(),
        }
    }

    pub fn new_shared(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Initial connection attempt for every instance. Failures leave the
    /// instance disconnected with `last_update` stamped so the reconnect
    /// scheduler picks it up later; startup itself never fails here.
    pub async fn connect_all(&self) {
        let targets: Vec<(usize, String, String, String, String)> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .enumerate()
                .map(|(idx, i)| {
                    (
                        idx,
                        i.name.clone(),
                        i.base_url.clone(),
                        i.username.clone(),
                        i.password.clone(),
                    )
                })
                .collect()
        };

        for (idx, name, url, username, password) in targets {
            match try_login(&url, &username, &password, self.config.connect_timeout()).await {
                Ok(client) => {
                    tracing::info!(instance = %name, "connected");
                    let mut instances = self.instances.lock().await;
                    let instance = &mut instances[idx];
                    instance.client = Some(client);
                    instance.connected = true;
                    instance.last_update = Instant::now();
                }
                Err(e) => {
                    tracing::error!(instance = %name, error = %e, "initial connection failed");
                    let mut instances = self.instances.lock().await;
                    instances[idx].last_update = Instant::now();
                }
            }
        }
    }

    /// Read-only copy of every instance record.
    pub async fn snapshot(&self) -> Vec<Instance> {
        self.instances.lock().await.clone()
    }

    pub async fn connected_count(&self) -> usize {
        self.instances
            .lock()
            .await
            .iter()
            .filter(|i| i.connected)
            .count()
    }

    /// Run a closure against the locked instance list. The closure must not
    /// block; it exists so the dispatcher can select and copy under one
    /// short critical section.
    pub async fn with_instances<R>(&self, f: impl FnOnce(&mut Vec<Instance>) -> R) -> R {
        let mut instances = self.instances.lock().await;
        f(&mut instances)
    }

    /// Refresh metrics for every connected instance and feed each snapshot
    /// into the announce supervisor.
    ///
    /// A single failed snapshot is retried once after a pause; only the
    /// second failure marks the instance disconnected.
    pub async fn status_tick(&self, announce: &mut AnnounceSupervisor) {
        let targets: Vec<(usize, String, Arc<Client>)> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .enumerate()
                .filter(|(_, i)| i.connected)
                .filter_map(|(idx, i)| i.client.clone().map(|c| (idx, i.name.clone(), c)))
                .collect()
        };

        for (idx, name, client) in targets {
            let maindata = match fetch_maindata_with_retry(&name, &client).await {
                Ok(maindata) => maindata,
                Err(e) => {
                    tracing::error!(
                        instance = %name,
                        error = %e,
                        "status refresh failed twice, marking disconnected"
                    );
                    let mut instances = self.instances.lock().await;
                    let instance = &mut instances[idx];
                    instance.connected = false;
                    instance.last_update = Instant::now();
                    continue;
                }
            };

            let probe_url = {
                let mut instances = self.instances.lock().await;
                let instance = &mut instances[idx];
                instance.apply_maindata(&maindata);
                tracing::debug!(
                    instance = %name,
                    upload_kbps = %format_args!("{:.1}", instance.upload_kbps),
                    download_kbps = %format_args!("{:.1}", instance.download_kbps),
                    active_downloads = instance.active_downloads,
                    free_gib = %format_args!("{:.1}", instance.free_space_bytes as f64 / 1024f64.powi(3)),
                    "instance status updated"
                );
                if instance.traffic_probe_due() {
                    instance.traffic_check_url.clone()
                } else {
                    None
                }
            };

            let now_epoch = chrono::Utc::now().timestamp();
            announce
                .process_instance(&name, &client, &maindata.torrents, now_epoch)
                .await;

            if let Some(url) = probe_url {
                let bytes = self.probe.outbound_bytes(&name, &url).await;
                let mut instances = self.instances.lock().await;
                instances[idx].traffic_out_bytes = bytes;
            }
        }
    }

    /// Schedule reconnect tasks for instances whose retry window has
    /// elapsed. Marking happens under the lock; the tasks are spawned
    /// outside it so a slow login never blocks the status loop.
    pub async fn check_and_schedule_reconnects(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.reconnect_interval);

        let due: Vec<(usize, String)> = {
            let mut instances = self.instances.lock().await;
            let mut due = Vec::new();
            for (idx, instance) in instances.iter_mut().enumerate() {
                if due_for_reconnect(instance, interval) {
                    instance.reconnecting = true;
                    instance.last_update = Instant::now();
                    due.push((idx, instance.name.clone()));
                }
            }
            due
        };

        for (idx, name) in due {
            tracing::info!(instance = %name, "scheduling reconnect");
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                registry.reconnect_task(idx, name).await;
            });
        }
    }

    async fn reconnect_task(&self, idx: usize, name: String) {
        let (url, username, password) = {
            let instances = self.instances.lock().await;
            let instance = &instances[idx];
            (
                instance.base_url.clone(),
                instance.username.clone(),
                instance.password.clone(),
            )
        };

        let max_attempts = self.config.max_reconnect_attempts.max(1);
        for attempt in 1..=max_attempts {
            match try_login(&url, &username, &password, self.config.connect_timeout()).await {
                Ok(client) => {
                    tracing::info!(
                        instance = %name,
                        attempt,
                        max_attempts,
                        "reconnected"
                    );
                    let mut instances = self.instances.lock().await;
                    let instance = &mut instances[idx];
                    instance.client = Some(client);
                    instance.connected = true;
                    instance.reconnecting = false;
                    instance.last_update = Instant::now();
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        instance = %name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(RECONNECT_ATTEMPT_PAUSE).await;
                    }
                }
            }
        }

        tracing::error!(instance = %name, "reconnect failed, will retry later");
        let mut instances = self.instances.lock().await;
        let instance = &mut instances[idx];
        instance.reconnecting = false;
        instance.last_update = Instant::now();
    }

    /// Record one successful placement on the named instance.
    pub async fn record_placement(&self, name: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.iter_mut().find(|i| i.name == name) {
            instance.new_tasks_this_round += 1;
            instance.total_added_tasks += 1;
            instance.last_update = Instant::now();
        }
    }

    /// Reset the per-pass placement counters; called once after every full
    /// dispatch pass.
    pub async fn reset_round_counters(&self) {
        let mut instances = self.instances.lock().await;
        for instance in instances.iter_mut() {
            instance.new_tasks_this_round = 0;
        }
    }

    pub async fn log_status_summary(&self) {
        let instances = self.instances.lock().await;
        let total = instances.len();
        let connected = instances.iter().filter(|i| i.connected).count();
        let disconnected: Vec<&str> = instances
            .iter()
            .filter(|i| !i.connected)
            .map(|i| i.name.as_str())
            .collect();

        if disconnected.is_empty() {
            tracing::debug!(connected, total, "instance status");
        } else {
            tracing::debug!(
                connected,
                total,
                disconnected = %disconnected.join(", "),
                "instance status"
            );
        }
    }
}

fn due_for_reconnect(instance: &Instance, interval: Duration) -> bool {
    !instance.connected && !instance.reconnecting && instance.last_update.elapsed() >= interval
}

async fn try_login(
    url: &str,
    username: &str,
    password: &str,
    timeout: Duration,
) -> qbit_client::Result<Arc<Client>> {
    let client = Client::new(url, timeout)?;
    client.login(username, password).await?;
    Ok(Arc::new(client))
}

/// One retry after a pause; transient hiccups must not disconnect an
/// instance.
async fn fetch_maindata_with_retry(name: &str, client: &Client) -> qbit_client::Result<MainData> {
    match client.sync_maindata().await {
        Ok(maindata) => Ok(maindata),
        Err(first) => {
            tracing::warn!(
                instance = %name,
                error = %first,
                "status refresh failed, retrying once"
            );
            tokio::time::sleep(SNAPSHOT_RETRY_PAUSE).await;
            client.sync_maindata().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceConfig, SortKey};

    fn test_config(names: &[&str], reconnect_interval: u64) -> Arc<Config> {
        Arc::new(Config {
            qbittorrent_instances: names
                .iter()
                .map(|name| InstanceConfig {
                    name: name.to_string(),
                    // Port 1 is closed; reconnect attempts fail fast.
                    url: "http://127.0.0.1:1".to_string(),
                    username: "admin".to_string(),
                    password: "pass".to_string(),
                    traffic_check_url: None,
                    traffic_limit: None,
                    reserved_space: None,
                })
                .collect(),
            max_new_tasks_per_instance: 2,
            primary_sort_key: SortKey::UploadSpeed,
            fast_announce_interval: 3.0,
            max_announce_retries: 12,
            reconnect_interval,
            max_reconnect_attempts: 1,
            connection_timeout: 10,
            debug_add_stopped: false,
            webhook_port: 5000,
            webhook_path: "/webhook".to_string(),
            log_dir: None,
            torrent_watch_dir: None,
            torrent_max_age_minutes: 30,
        })
    }

    #[tokio::test]
    async fn test_registry_builds_instances_from_config() {
        let registry = InstanceRegistry::new(test_config(&["qb1", "qb2"], 180));
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|i| !i.connected && !i.reconnecting));
        assert_eq!(registry.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_record_placement_and_round_reset() {
        let registry = InstanceRegistry::new(test_config(&["qb1", "qb2"], 180));
        registry.record_placement("qb1").await;
        registry.record_placement("qb1").await;

        let snapshot = registry.snapshot().await;
        let qb1 = snapshot.iter().find(|i| i.name == "qb1").unwrap();
        assert_eq!(qb1.new_tasks_this_round, 2);
        assert_eq!(qb1.total_added_tasks, 2);

        registry.reset_round_counters().await;
        let snapshot = registry.snapshot().await;
        let qb1 = snapshot.iter().find(|i| i.name == "qb1").unwrap();
        assert_eq!(qb1.new_tasks_this_round, 0);
        // Lifetime counter is monotonic.
        assert_eq!(qb1.total_added_tasks, 2);
    }

    #[tokio::test]
    async fn test_fresh_instances_not_due_for_reconnect() {
        let registry = InstanceRegistry::new(test_config(&["qb1"], 180));
        let snapshot = registry.snapshot().await;
        // Disconnected but last_update is recent.
        assert!(!due_for_reconnect(&snapshot[0], Duration::from_secs(180)));
    }

    #[tokio::test]
    async fn test_due_for_reconnect_requires_idle_state() {
        let registry = InstanceRegistry::new(test_config(&["qb1"], 0));
        let mut instance = registry.snapshot().await.remove(0);

        // A zero interval makes any disconnected idle instance due.
        assert!(due_for_reconnect(&instance, Duration::ZERO));

        instance.reconnecting = true;
        assert!(!due_for_reconnect(&instance, Duration::ZERO));

        instance.reconnecting = false;
        instance.connected = true;
        assert!(!due_for_reconnect(&instance, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_connected_and_reconnecting_stay_exclusive() {
        let registry = InstanceRegistry::new_shared(test_config(&["qb1"], 0));
        registry.check_and_schedule_reconnects().await;

        // The instance is now marked reconnecting (or the spawned task
        // already gave up); either way the states stay exclusive.
        let snapshot = registry.snapshot().await;
        assert!(!(snapshot[0].connected && snapshot[0].reconnecting));
    }
}
