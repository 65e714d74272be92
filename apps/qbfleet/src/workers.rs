//! Long-lived worker loops.
//!
//! Two loops drive the balancer: the status worker refreshes instance
//! metrics and supervises announces, the dispatch worker drains the ingest
//! queue. Both run until the cancellation token fires; a failed iteration is
//! logged and followed by a short pause, the loop itself never exits on
//! error.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::services::{AnnounceSupervisor, Dispatcher, InstanceRegistry};

/// Pause after an iteration that blew up.
const ERROR_RETRY_PAUSE: Duration = Duration::from_secs(5);
/// Cadence of the dispatch loop.
const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Status loop: metrics refresh, announce supervision, summary log,
/// reconnect scheduling.
///
/// Sleeps one announce interval while any torrent is under supervision,
/// twice that otherwise.
pub async fn status_worker(
    registry: Arc<InstanceRegistry>,
    config: Arc<Config>,
    cancel: CancellationToken,
) {
    tracing::info!("status worker started");
    let mut announce = AnnounceSupervisor::new(&config);
    let interval = config.fast_announce_duration();

    loop {
        registry.status_tick(&mut announce).await;
        registry.log_status_summary().await;
        registry.check_and_schedule_reconnects().await;

        let sleep = if announce.has_pending() {
            interval
        } else {
            interval * 2
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    tracing::info!("status worker stopped");
}

/// Dispatch loop: one pass over the pending queue per second.
pub async fn dispatch_worker(dispatcher: Dispatcher, cancel: CancellationToken) {
    tracing::info!("dispatch worker started");

    loop {
        dispatcher.dispatch_pass().await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(DISPATCH_INTERVAL) => {}
        }
    }

    tracing::info!("dispatch worker stopped");
}

/// Run a fallible worker body forever, pausing after failures.
pub async fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, mut body: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<()>>,
{
    loop {
        match body().await {
            Ok(()) => return,
            Err(e) => {
                tracing::error!(worker = name, error = %e, "worker failed, restarting");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ERROR_RETRY_PAUSE) => {}
        }
    }
}
