//! File-watch front-end: ingests `.torrent` files dropped into a directory.
//!
//! An alternate ingest path beside the webhook, for setups where an indexer
//! writes torrent files to disk. Entries flow through the same queue; the
//! dispatcher recognizes local paths and uploads the file content.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::services::queue::IngestQueue;

/// Consecutive equal size samples required before a file counts as fully
/// written.
const SIZE_STABLE_SAMPLES: u32 = 3;
const SIZE_SAMPLE_INTERVAL: Duration = Duration::from_millis(300);
/// Upper bound on stability sampling before the file is given up on.
const SIZE_SAMPLE_LIMIT: u32 = SIZE_STABLE_SAMPLES + 30;

/// Cadence of the expired-file sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

lazy_static::lazy_static! {
    /// Leading `[category]` prefix in a torrent file name.
    static ref CATEGORY_RE: Regex = Regex::new(r"^\[([^\]]+)\]").expect("static regex");
}

/// Category embedded in the file name, e.g. `[Movies]example.torrent`.
pub fn extract_category(file_name: &str) -> Option<String> {
    CATEGORY_RE
        .captures(file_name)
        .map(|captures| captures[1].to_string())
}

/// Move a dispatched torrent file into a `processed/` sibling directory.
pub fn move_to_processed(path: &Path) -> std::io::Result<PathBuf> {
    let processed_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("processed");
    std::fs::create_dir_all(&processed_dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    let destination = processed_dir.join(file_name);
    std::fs::rename(path, &destination)?;
    Ok(destination)
}

fn file_age(path: &Path) -> std::io::Result<Duration> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified.elapsed().unwrap_or_default())
}

fn is_torrent_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("torrent"))
        .unwrap_or(false)
}

/// Watches a directory for incoming `.torrent` files.
pub struct TorrentWatcher {
    queue: Arc<IngestQueue>,
    watch_dir: PathBuf,
    max_age: Duration,
}

impl TorrentWatcher {
    pub fn new(queue: Arc<IngestQueue>, watch_dir: PathBuf, max_age: Duration) -> Self {
        Self {
            queue,
            watch_dir,
            max_age,
        }
    }

    /// Watch until cancelled. Scans pre-existing files first, then follows
    /// filesystem events; a periodic sweep deletes entries that aged out
    /// while queued.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.watch_dir)?;

        let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<Event>>(64);
        // notify runs the callback on its own thread; bridge into the async
        // loop through the channel.
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.blocking_send(event);
        })
        .map_err(|e| crate::error::AppError::Internal(format!("failed to create watcher: {}", e)))?;
        watcher
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                crate::error::AppError::Internal(format!(
                    "failed to watch {:?}: {}",
                    self.watch_dir, e
                ))
            })?;

        tracing::info!(dir = ?self.watch_dir, "watching for torrent files");
        self.scan_existing().await;

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("file watcher stopping");
                    return Ok(());
                }
                _ = sweep.tick() => {
                    self.sweep_expired().await;
                }
                event = rx.recv() => {
                    match event {
                        Some(Ok(event)) => self.handle_event(event),
                        Some(Err(e)) => tracing::warn!(error = %e, "watch event error"),
                        None => {
                            tracing::warn!("watch event channel closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }
        for path in event.paths {
            if is_torrent_file(&path) {
                tracing::info!(file = ?path.file_name(), "new torrent file");
                self.spawn_admission(path);
            }
        }
    }

    /// Admit a freshly created file once its size stops changing, so a
    /// half-written file is never uploaded.
    fn spawn_admission(&self, path: PathBuf) {
        let queue = Arc::clone(&self.queue);
        let max_age = self.max_age;
        tokio::spawn(async move {
            if wait_for_stable_size(&path).await {
                admit(&queue, &path, max_age).await;
            }
        });
    }

    /// Pick up files that were already present at startup.
    async fn scan_existing(&self) {
        let entries = match std::fs::read_dir(&self.watch_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(dir = ?self.watch_dir, error = %e, "could not scan watch directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if is_torrent_file(&path) {
                admit(&self.queue, &path, self.max_age).await;
            }
        }
    }

    /// Delete queued files that exceeded the age limit while waiting, and
    /// drop entries whose file disappeared.
    async fn sweep_expired(&self) {
        let max_age = self.max_age;
        let dropped = self
            .queue
            .drain_rejected(|torrent| {
                let path = Path::new(&torrent.download_url);
                if !path.starts_with(&self.watch_dir) {
                    return true;
                }
                match file_age(path) {
                    Ok(age) => age <= max_age,
                    Err(_) => false,
                }
            })
            .await;

        for torrent in dropped {
            let path = Path::new(&torrent.download_url);
            match std::fs::remove_file(path) {
                Ok(()) => {
                    tracing::info!(name = %torrent.release_name, "deleted expired torrent file")
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(name = %torrent.release_name, "queued file disappeared")
                }
                Err(e) => {
                    tracing::error!(name = %torrent.release_name, error = %e, "could not delete expired file")
                }
            }
        }
    }
}

async fn wait_for_stable_size(path: &Path) -> bool {
    let mut last_size = None;
    let mut stable = 0;

    for _ in 0..SIZE_SAMPLE_LIMIT {
        let size = match std::fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                tracing::debug!(path = ?path, "file vanished during stability check");
                return false;
            }
        };

        if last_size == Some(size) {
            stable += 1;
            if stable >= SIZE_STABLE_SAMPLES {
                return true;
            }
        } else {
            stable = 0;
            last_size = Some(size);
        }

        tokio::time::sleep(SIZE_SAMPLE_INTERVAL).await;
    }

    tracing::warn!(path = ?path, "file size never settled, skipping");
    false
}

/// Age-check a file and enqueue it.
async fn admit(queue: &IngestQueue, path: &Path, max_age: Duration) {
    let age = match file_age(path) {
        Ok(age) => age,
        Err(e) => {
            tracing::error!(path = ?path, error = %e, "could not stat torrent file");
            return;
        }
    };

    if age > max_age {
        tracing::warn!(
            file = ?path.file_name(),
            age_secs = age.as_secs(),
            limit_secs = max_age.as_secs(),
            "skipping torrent file past the age limit"
        );
        return;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let release_name = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.clone());
    let category = extract_category(&file_name);

    queue
        .enqueue(&path.to_string_lossy(), &release_name, category)
        .await;
}
