//! Dispatch scheduling: which instance gets the next torrent.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use qbit_client::{AddTorrentParams, Client};

use crate::config::{Config, SortKey};
use crate::services::instance::Instance;
use crate::services::queue::{IngestQueue, PendingTorrent};
use crate::services::registry::InstanceRegistry;
use crate::services::watcher;

/// Outcome of one selection over the instance list.
#[derive(Debug)]
pub enum Selection<'a> {
    Chosen(&'a Instance),
    /// The preferred instance has used its per-pass budget. Metrics are
    /// frozen during a pass, so the same instance would win for every
    /// remaining torrent; the pass must end.
    WinnerCapped(&'a Instance),
    /// Nothing connected with disk and traffic headroom.
    NoCandidates,
}

/// Whether the instance may receive torrents at all: connected, above its
/// free-space floor, and within its traffic budget.
pub fn is_candidate(instance: &Instance) -> bool {
    instance.connected
        && instance.free_space_bytes > instance.reserved_space_bytes
        && instance.traffic_within_limit()
}

/// The configured primary ordering factor; smallest wins for all three.
pub fn primary_sort_value(instance: &Instance, key: SortKey) -> f64 {
    match key {
        SortKey::UploadSpeed => instance.upload_kbps,
        SortKey::DownloadSpeed => instance.download_kbps,
        SortKey::ActiveDownloads => instance.active_downloads as f64,
    }
}

/// Lexicographic ordering: primary value, then fewer lifetime placements,
/// then more free space.
fn selection_order(a: &Instance, b: &Instance, key: SortKey) -> Ordering {
    primary_sort_value(a, key)
        .total_cmp(&primary_sort_value(b, key))
        .then_with(|| a.total_added_tasks.cmp(&b.total_added_tasks))
        .then_with(|| b.free_space_bytes.cmp(&a.free_space_bytes))
}

/// Pick the dispatch target among `instances`.
pub fn select_best<'a>(
    instances: &'a [Instance],
    key: SortKey,
    max_new_tasks: u32,
) -> Selection<'a> {
    let winner = instances
        .iter()
        .filter(|i| is_candidate(i))
        .min_by(|a, b| selection_order(a, b, key));

    match winner {
        None => Selection::NoCandidates,
        Some(instance) if instance.new_tasks_this_round >= max_new_tasks => {
            Selection::WinnerCapped(instance)
        }
        Some(instance) => Selection::Chosen(instance),
    }
}

enum Target {
    Ready(String, Arc<Client>),
    Capped,
    None,
}

/// Drains the ingest queue onto the fleet, one pass per second.
pub struct Dispatcher {
    registry: Arc<InstanceRegistry>,
    queue: Arc<IngestQueue>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        queue: Arc<IngestQueue>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            queue,
            config,
        }
    }

    /// One traversal of the pending queue in FIFO order.
    ///
    /// Failed placements stay queued for the next pass. The per-pass
    /// counters are reset after the full traversal, never mid-pass.
    pub async fn dispatch_pass(&self) {
        let pending = self.queue.snapshot().await;
        if pending.is_empty() {
            return;
        }
        tracing::debug!(pending = pending.len(), "dispatching pending torrents");

        for torrent in &pending {
            match self.select_target().await {
                Target::Ready(name, client) => {
                    if self.try_add(&name, &client, torrent).await {
                        self.queue.remove(&torrent.download_url).await;
                        self.registry.record_placement(&name).await;
                    }
                }
                Target::Capped => {
                    tracing::debug!("preferred instance reached its per-pass cap, ending pass");
                    break;
                }
                Target::None => {
                    tracing::warn!("no instance available for pending torrents");
                    break;
                }
            }
        }

        self.registry.reset_round_counters().await;
    }

    async fn select_target(&self) -> Target {
        let key = self.config.primary_sort_key;
        let cap = self.config.max_new_tasks_per_instance;
        self.registry
            .with_instances(|instances| match select_best(instances, key, cap) {
                Selection::Chosen(instance) => {
                    tracing::debug!(
                        instance = %instance.name,
                        sort_key = key.as_str(),
                        primary = primary_sort_value(instance, key),
                        free_gib = %format_args!(
                            "{:.1}",
                            instance.free_space_bytes as f64 / 1024f64.powi(3)
                        ),
                        "selected instance"
                    );
                    match instance.client.clone() {
                        Some(client) => Target::Ready(instance.name.clone(), client),
                        None => Target::None,
                    }
                }
                Selection::WinnerCapped(_) => Target::Capped,
                Selection::NoCandidates => Target::None,
            })
            .await
    }

    /// Hand one torrent to the daemon. Returns whether it was accepted.
    async fn try_add(&self, instance: &str, client: &Client, torrent: &PendingTorrent) -> bool {
        let params = match self.build_params(torrent).await {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(
                    instance = %instance,
                    name = %torrent.release_name,
                    error = %e,
                    "could not read torrent file"
                );
                return false;
            }
        };

        match client.add_torrent(params).await {
            // The daemon signals acceptance with a body starting with "Ok".
            Ok(body) if body.starts_with("Ok") => {
                tracing::info!(
                    instance = %instance,
                    name = %torrent.release_name,
                    category = ?torrent.category,
                    "torrent added"
                );
                if !is_remote_url(&torrent.download_url) {
                    if let Err(e) = watcher::move_to_processed(Path::new(&torrent.download_url)) {
                        tracing::warn!(
                            path = %torrent.download_url,
                            error = %e,
                            "could not archive processed torrent file"
                        );
                    }
                }
                true
            }
            Ok(body) => {
                tracing::error!(
                    instance = %instance,
                    name = %torrent.release_name,
                    response = %body.trim(),
                    "daemon rejected torrent"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    instance = %instance,
                    name = %torrent.release_name,
                    error = %e,
                    "add-torrent call failed"
                );
                false
            }
        }
    }

    async fn build_params(&self, torrent: &PendingTorrent) -> std::io::Result<AddTorrentParams> {
        let mut params = if is_remote_url(&torrent.download_url) {
            AddTorrentParams::from_url(torrent.download_url.clone())
        } else {
            // File-watch entries carry a local path instead of a URL.
            let data = tokio::fs::read(&torrent.download_url).await?;
            let file_name = Path::new(&torrent.download_url)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload.torrent".to_string());
            AddTorrentParams::from_file(file_name, data)
        };
        params.category = torrent.category.clone();
        params.stopped = self.config.debug_add_stopped;
        Ok(params)
    }
}

fn is_remote_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
