use std::fs::OpenOptions;
use std::io::LineWriter;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use qbfleet::api::{self, WebhookState};
use qbfleet::config::Config;
use qbfleet::services::{Dispatcher, IngestQueue, InstanceRegistry, TorrentWatcher};
use qbfleet::workers;

/// Initialize tracing with env-filter.
/// RUST_LOG controls log levels; default is debug for our crate, info for
/// axum, warn for dependencies. With a log_dir configured, everything is
/// also appended to a file there.
fn init_tracing(log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("qbfleet=debug,axum=info,warn"));

    let base = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let file_writer = log_dir.and_then(|dir| match open_log_file(dir) {
        Ok(writer) => Some(writer),
        Err(e) => {
            eprintln!("warning: could not open log file in {:?}: {}", dir, e);
            None
        }
    });

    match file_writer {
        Some(writer) => base
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init(),
        None => base.init(),
    }
}

fn open_log_file(dir: &Path) -> std::io::Result<std::sync::Mutex<LineWriter<std::fs::File>>> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("qbfleet.log"))?;
    Ok(std::sync::Mutex::new(LineWriter::new(file)))
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    // Logging needs the config (log_dir), so config load errors go to
    // stderr directly.
    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    init_tracing(config.log_dir.as_deref());

    tracing::info!("starting qbfleet v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        instances = config.qbittorrent_instances.len(),
        sort_key = config.primary_sort_key.as_str(),
        max_new_tasks_per_instance = config.max_new_tasks_per_instance,
        "configuration loaded from {}",
        config_path
    );

    let config = Arc::new(config);
    let registry = InstanceRegistry::new_shared(Arc::clone(&config));

    registry.connect_all().await;
    tracing::info!(
        connected = registry.connected_count().await,
        total = config.qbittorrent_instances.len(),
        "initial connections finished"
    );

    let queue = Arc::new(IngestQueue::new());
    let cancel = CancellationToken::new();

    // Status worker: metrics, announce supervision, reconnects.
    tokio::spawn(workers::status_worker(
        Arc::clone(&registry),
        Arc::clone(&config),
        cancel.clone(),
    ));

    // Dispatch worker: drains the queue every second.
    let dispatcher = Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        Arc::clone(&config),
    );
    tokio::spawn(workers::dispatch_worker(dispatcher, cancel.clone()));

    // Optional file-watch front-end.
    if let Some(watch_dir) = config.torrent_watch_dir.clone() {
        let watcher_queue = Arc::clone(&queue);
        let max_age = config.torrent_max_age();
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            let restart_cancel = watcher_cancel.clone();
            workers::supervise("file-watcher", restart_cancel, move || {
                let watcher = TorrentWatcher::new(
                    Arc::clone(&watcher_queue),
                    watch_dir.clone(),
                    max_age,
                );
                let cancel = watcher_cancel.clone();
                async move { watcher.run(cancel).await }
            })
            .await;
        });
    }

    // Ctrl-C cancels every worker and stops the webhook server.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let state = WebhookState {
        queue: Arc::clone(&queue),
        registry: Arc::clone(&registry),
    };
    let app = api::router(state, &config.webhook_path);

    let addr = config.webhook_addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind webhook server");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, path = %config.webhook_path, "webhook server listening");

    let shutdown = cancel.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "webhook server failed");
        std::process::exit(1);
    }

    cancel.cancel();
    tracing::info!("qbfleet stopped");
}
