//! Announce supervision for freshly added torrents.
//!
//! Trackers frequently miss or reject the first announce of a brand-new
//! torrent; a missed window costs the whole point of racing a release. For
//! roughly the first two minutes of a torrent's life the supervisor watches
//! every snapshot and forces re-announces when the tracker state looks
//! wrong, then forgets the torrent.

use std::collections::HashMap;

use qbit_client::{Client, TorrentEntry, Tracker, TrackerStatus};

use crate::config::Config;

/// Completed torrents leave supervision after this age, seconds.
const COMPLETED_AGE_CUTOFF: i64 = 60;
/// Hard upper bound of the supervision window, seconds. Logged as the
/// two-minute window even though the cutoff sits slightly above it.
const MAX_SUPERVISED_AGE: i64 = 130;
/// Torrents younger than this are left alone so the initial tracker
/// contact is not raced.
const MIN_SUPERVISED_AGE: i64 = 2;

/// Tracker error fragments that mean the torrent is not (or no longer)
/// known upstream.
const ERROR_KEYWORDS: &[&str] = &["unregistered", "not registered", "not found", "not exist"];

/// What the supervisor decided for one observation of one torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Outside the supervision window; counter dropped.
    Evicted,
    /// Unconditional re-announce checkpoint hit (attempt count inside).
    Forced(u32),
    /// Attempt budget exhausted; keep counting but stop acting.
    CapReached(u32),
    /// Still under budget; tracker state decides.
    Inspect(u32),
}

/// Per-torrent announce attempt counters plus the decision rules.
///
/// Single writer: only the status worker touches this, so the map needs no
/// lock. Counters survive instance reconnects on purpose; a hash observed
/// again elsewhere continues its count.
pub struct AnnounceSupervisor {
    counters: HashMap<String, u32>,
    max_retries: u32,
    first_checkpoint: u32,
    second_checkpoint: u32,
}

impl AnnounceSupervisor {
    pub fn new(config: &Config) -> Self {
        let interval = config.fast_announce_interval;
        Self {
            counters: HashMap::new(),
            max_retries: config.max_announce_retries,
            // Observation counts at which ~60s and ~120s of supervision
            // have elapsed.
            first_checkpoint: (60.0 / interval) as u32,
            second_checkpoint: (120.0 / interval) as u32,
        }
    }

    /// Whether any torrent is currently under supervision. Drives the
    /// status worker's adaptive sleep.
    pub fn has_pending(&self) -> bool {
        !self.counters.is_empty()
    }

    /// Run the supervision rules over one instance's snapshot.
    pub async fn process_instance(
        &mut self,
        instance: &str,
        client: &Client,
        torrents: &HashMap<String, TorrentEntry>,
        now_epoch: i64,
    ) {
        for (hash, torrent) in torrents {
            let age = now_epoch - torrent.added_on;
            let completed = torrent.progress >= 1.0;

            match self.observe(hash, age, completed) {
                Step::Evicted | Step::CapReached(_) => {}
                Step::Forced(attempt) => {
                    tracing::info!(
                        instance = %instance,
                        name = %torrent.name,
                        age,
                        attempt,
                        "forcing re-announce at checkpoint"
                    );
                    reannounce(instance, client, hash, &torrent.name, "forced").await;
                }
                Step::Inspect(attempt) => {
                    let trackers = match client.trackers(hash).await {
                        Ok(trackers) => trackers,
                        Err(e) => {
                            tracing::warn!(
                                instance = %instance,
                                name = %torrent.name,
                                error = %e,
                                "failed to fetch trackers"
                            );
                            continue;
                        }
                    };

                    let usable = usable_trackers(&trackers);
                    if usable.is_empty() {
                        continue;
                    }

                    let reasons = reannounce_reasons(&usable, torrent.progress, torrent.num_leechs);
                    if !reasons.is_empty() {
                        tracing::info!(
                            instance = %instance,
                            name = %torrent.name,
                            age,
                            attempt,
                            reasons = %reasons.join("+"),
                            "re-announcing"
                        );
                        reannounce(instance, client, hash, &torrent.name, &reasons.join("+")).await;
                    }
                }
            }
        }
    }

    /// Advance the counter for one observation and classify it.
    ///
    /// Rule order matters: eviction first, then the forced checkpoints,
    /// then the retry cap.
    pub fn observe(&mut self, hash: &str, age: i64, completed: bool) -> Step {
        if should_evict(age, completed) {
            if self.counters.remove(hash).is_some() {
                if age > MAX_SUPERVISED_AGE {
                    tracing::debug!(hash = %hash, age, "torrent older than 2 minutes, dropping supervision");
                } else {
                    tracing::debug!(hash = %hash, age, "torrent completed, dropping supervision");
                }
            }
            return Step::Evicted;
        }

        let counter = self.counters.entry(hash.to_string()).or_insert(0);
        *counter += 1;
        let attempt = *counter;

        if (attempt == self.first_checkpoint || attempt == self.second_checkpoint) && !completed {
            return Step::Forced(attempt);
        }

        if attempt >= self.max_retries {
            return Step::CapReached(attempt);
        }

        Step::Inspect(attempt)
    }
}

fn should_evict(age: i64, completed: bool) -> bool {
    (completed && age > COMPLETED_AGE_CUTOFF) || age > MAX_SUPERVISED_AGE || age < MIN_SUPERVISED_AGE
}

/// Real HTTP(S) trackers only; the daemon lists DHT/PeX/LSD as
/// pseudo-entries.
fn usable_trackers(trackers: &[Tracker]) -> Vec<&Tracker> {
    trackers
        .iter()
        .filter(|t| {
            let url = t.url.to_lowercase();
            if url == "dht" || url == "pex" || url == "lsd" {
                return false;
            }
            url.starts_with("http://") || url.starts_with("https://")
        })
        .collect()
}

/// Why a torrent deserves a re-announce, if at all.
fn reannounce_reasons(usable: &[&Tracker], progress: f64, num_leechs: i64) -> Vec<&'static str> {
    let mut reasons = Vec::new();

    let all_failed = usable.iter().all(|t| {
        matches!(
            t.status,
            TrackerStatus::NotContacted | TrackerStatus::Updating | TrackerStatus::NotWorking
        )
    });
    if all_failed {
        reasons.push("all-trackers-failing");
    }

    let error_message = usable.iter().any(|t| {
        let msg = t.msg.to_lowercase();
        ERROR_KEYWORDS.iter().any(|keyword| msg.contains(keyword))
    });
    if error_message {
        reasons.push("tracker-error");
    }

    if progress < 0.8 && num_leechs < 3 {
        reasons.push("peer-starved");
    }

    reasons
}

/// Failures here are warnings only; the counter and the instance state are
/// untouched.
async fn reannounce(instance: &str, client: &Client, hash: &str, name: &str, label: &str) {
    if let Err(e) = client.reannounce(&[hash]).await {
        tracing::warn!(
            instance = %instance,
            name = %name,
            label = %label,
            error = %e,
            "re-announce failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InstanceConfig, SortKey};

    fn test_config(fast_interval: f64, max_retries: u32) -> Config {
        Config {
            qbittorrent_instances: vec![InstanceConfig {
                name: "qb1".to_string(),
                url: "http://127.0.0.1:8080".to_string(),
                username: "a".to_string(),
                password: "b".to_string(),
                traffic_check_url: None,
                traffic_limit: None,
                reserved_space: None,
            }],
            max_new_tasks_per_instance: 1,
            primary_sort_key: SortKey::UploadSpeed,
            fast_announce_interval: fast_interval,
            max_announce_retries: max_retries,
            reconnect_interval: 180,
            max_reconnect_attempts: 1,
            connection_timeout: 10,
            debug_add_stopped: false,
            webhook_port: 5000,
            webhook_path: "/webhook".to_string(),
            log_dir: None,
            torrent_watch_dir: None,
            torrent_max_age_minutes: 30,
        }
    }

    fn tracker(url: &str, status: TrackerStatus, msg: &str) -> Tracker {
        Tracker {
            url: url.to_string(),
            status,
            tier: 0,
            msg: msg.to_string(),
        }
    }

    const HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_eviction_bounds() {
        assert!(should_evict(1, false), "younger than 2s");
        assert!(!should_evict(2, false));
        assert!(!should_evict(130, false));
        assert!(should_evict(131, false), "older than the hard bound");
        assert!(!should_evict(60, true));
        assert!(should_evict(61, true), "completed and past 60s");
    }

    #[test]
    fn test_checkpoints_from_interval() {
        let supervisor = AnnounceSupervisor::new(&test_config(3.0, 12));
        assert_eq!(supervisor.first_checkpoint, 20);
        assert_eq!(supervisor.second_checkpoint, 40);

        let supervisor = AnnounceSupervisor::new(&test_config(2.5, 12));
        assert_eq!(supervisor.first_checkpoint, 24);
        assert_eq!(supervisor.second_checkpoint, 48);
    }

    #[test]
    fn test_forced_on_first_checkpoint() {
        let mut supervisor = AnnounceSupervisor::new(&test_config(3.0, 12));
        for i in 1..20 {
            let step = supervisor.observe(HASH, 30, false);
            assert_ne!(step, Step::Forced(i), "no forced before the checkpoint");
        }
        assert_eq!(supervisor.observe(HASH, 61, false), Step::Forced(20));
    }

    #[test]
    fn test_forced_skipped_for_completed_torrent() {
        let mut supervisor = AnnounceSupervisor::new(&test_config(3.0, 50));
        for _ in 1..20 {
            supervisor.observe(HASH, 30, false);
        }
        // 20th observation but already complete and still under 60s old:
        // the checkpoint does not fire, the torrent is merely inspected.
        assert_eq!(supervisor.observe(HASH, 59, true), Step::Inspect(20));
    }

    #[test]
    fn test_cap_reached_after_max_retries() {
        let mut supervisor = AnnounceSupervisor::new(&test_config(3.0, 3));
        assert_eq!(supervisor.observe(HASH, 30, false), Step::Inspect(1));
        assert_eq!(supervisor.observe(HASH, 33, false), Step::Inspect(2));
        assert_eq!(supervisor.observe(HASH, 36, false), Step::CapReached(3));
        assert_eq!(supervisor.observe(HASH, 39, false), Step::CapReached(4));
    }

    #[test]
    fn test_completed_torrent_evicted_and_stays_out() {
        let mut supervisor = AnnounceSupervisor::new(&test_config(3.0, 12));
        supervisor.observe(HASH, 30, false);
        assert!(supervisor.has_pending());

        assert_eq!(supervisor.observe(HASH, 61, true), Step::Evicted);
        assert!(!supervisor.has_pending());

        // Re-observation keeps it evicted; the counter is never recreated.
        assert_eq!(supervisor.observe(HASH, 70, true), Step::Evicted);
        assert!(!supervisor.has_pending());
    }

    #[test]
    fn test_counter_survives_across_instances() {
        // Same hash observed again simply continues the count.
        let mut supervisor = AnnounceSupervisor::new(&test_config(3.0, 12));
        assert_eq!(supervisor.observe(HASH, 10, false), Step::Inspect(1));
        assert_eq!(supervisor.observe(HASH, 13, false), Step::Inspect(2));
    }

    #[test]
    fn test_usable_trackers_filter() {
        let trackers = vec![
            tracker("DHT", TrackerStatus::Working, ""),
            tracker("PeX", TrackerStatus::Working, ""),
            tracker("lsd", TrackerStatus::Working, ""),
            tracker("udp://tracker.example:6969/announce", TrackerStatus::Working, ""),
            tracker("https://tracker.example/announce", TrackerStatus::Working, ""),
            tracker("HTTP://other.example/announce", TrackerStatus::Working, ""),
        ];
        let usable = usable_trackers(&trackers);
        assert_eq!(usable.len(), 2);
        assert!(usable.iter().all(|t| t.url.to_lowercase().starts_with("http")));
    }

    #[test]
    fn test_all_failed_reason() {
        let trackers = vec![
            tracker("https://a.example/announce", TrackerStatus::NotContacted, ""),
            tracker("https://b.example/announce", TrackerStatus::NotWorking, ""),
        ];
        let usable = usable_trackers(&trackers);
        let reasons = reannounce_reasons(&usable, 0.9, 10);
        assert_eq!(reasons, vec!["all-trackers-failing"]);
    }

    #[test]
    fn test_working_tracker_clears_all_failed() {
        let trackers = vec![
            tracker("https://a.example/announce", TrackerStatus::Working, ""),
            tracker("https://b.example/announce", TrackerStatus::NotWorking, ""),
        ];
        let usable = usable_trackers(&trackers);
        assert!(reannounce_reasons(&usable, 0.9, 10).is_empty());
    }

    #[test]
    fn test_error_keyword_is_case_insensitive() {
        let trackers = vec![tracker(
            "https://a.example/announce",
            TrackerStatus::Working,
            "Torrent NOT Registered with this tracker",
        )];
        let usable = usable_trackers(&trackers);
        assert_eq!(reannounce_reasons(&usable, 0.9, 10), vec!["tracker-error"]);
    }

    #[test]
    fn test_peer_starved_boundaries() {
        let trackers = vec![tracker("https://a.example/announce", TrackerStatus::Working, "")];
        let usable = usable_trackers(&trackers);

        assert_eq!(reannounce_reasons(&usable, 0.79, 2), vec!["peer-starved"]);
        assert!(reannounce_reasons(&usable, 0.8, 2).is_empty(), "progress at 0.8");
        assert!(reannounce_reasons(&usable, 0.79, 3).is_empty(), "three leechers");
    }

    #[test]
    fn test_reasons_union() {
        let trackers = vec![tracker(
            "https://a.example/announce",
            TrackerStatus::NotWorking,
            "torrent not found",
        )];
        let usable = usable_trackers(&trackers);
        let reasons = reannounce_reasons(&usable, 0.1, 0);
        assert_eq!(
            reasons,
            vec!["all-trackers-failing", "tracker-error", "peer-starved"]
        );
    }
}
