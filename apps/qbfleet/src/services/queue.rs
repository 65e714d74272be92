//! Deduplicated FIFO queue of torrents awaiting dispatch.

use tokio::sync::Mutex;

/// A torrent announced by a front-end but not yet placed on an instance.
///
/// `download_url` doubles as the dedup key; for the file-watch front-end it
/// carries a local path instead of an HTTP URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTorrent {
    pub download_url: String,
    pub release_name: String,
    pub category: Option<String>,
}

/// Shared ingest queue. Front-ends enqueue; the dispatch worker drains.
///
/// Not persisted; a restart drops pending entries.
#[derive(Default)]
pub struct IngestQueue {
    inner: Mutex<Vec<PendingTorrent>>,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a torrent unless its URL is empty, its name is empty, or an
    /// entry with the same URL is already pending. Returns whether the entry
    /// was accepted.
    pub async fn enqueue(&self, download_url: &str, release_name: &str, category: Option<String>) -> bool {
        if download_url.is_empty() || release_name.is_empty() {
            tracing::warn!(
                url = %download_url,
                name = %release_name,
                "rejecting torrent with empty url or name"
            );
            return false;
        }

        let mut queue = self.inner.lock().await;
        if queue.iter().any(|t| t.download_url == download_url) {
            tracing::debug!(name = %release_name, "torrent already pending, ignoring");
            return false;
        }

        tracing::info!(name = %release_name, category = ?category, "queued torrent");
        queue.push(PendingTorrent {
            download_url: download_url.to_string(),
            release_name: release_name.to_string(),
            category,
        });
        true
    }

    /// Copy of the queue in FIFO order.
    pub async fn snapshot(&self) -> Vec<PendingTorrent> {
        self.inner.lock().await.clone()
    }

    /// Drop the entry with the given URL, if still present.
    pub async fn remove(&self, download_url: &str) {
        self.inner.lock().await.retain(|t| t.download_url != download_url);
    }

    /// Keep only entries matching the predicate; returns the dropped ones.
    pub async fn drain_rejected<F>(&self, mut keep: F) -> Vec<PendingTorrent>
    where
        F: FnMut(&PendingTorrent) -> bool,
    {
        let mut queue = self.inner.lock().await;
        let mut dropped = Vec::new();
        queue.retain(|t| {
            if keep(t) {
                true
            } else {
                dropped.push(t.clone());
                false
            }
        });
        dropped
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
