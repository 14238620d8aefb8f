use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use quotemail_core::MemoryStore;

use quotemail_daemon::{ConnectionManager, Dispatcher, ImapInbox, Poller, SmtpOutbound};

fn log_dir() -> PathBuf {
    std::env::var("QUOTEMAIL_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

fn setup_logging(log_dir: &PathBuf) -> tracing_appender::non_blocking::WorkerGuard {
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "quotemail.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking.and(std::io::stdout))
        .with_ansi(false)
        .with_target(true)
        .init();

    info!("logging initialized, log directory: {:?}", log_dir);
    guard
}

fn poll_interval() -> Duration {
    let secs = std::env::var("POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    Duration::from_secs(secs.max(5))
}

#[tokio::main]
async fn main() {
    let dir = log_dir();
    let _guard = setup_logging(&dir);

    // The demo daemon runs against the in-memory store; the web application
    // wires its database-backed MessageStore here instead.
    let store = Arc::new(MemoryStore::new());
    let connections = Arc::new(ConnectionManager::new());

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(SmtpOutbound::new(connections.clone())),
    ));
    let poller = Arc::new(Poller::new(
        Arc::new(ImapInbox::new(connections.clone())),
        store.clone(),
    ));

    poller.start(poll_interval());
    info!("quotemail daemon running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
    }

    info!("shutting down");
    poller.stop().await;
    let pending = dispatcher.failure_queue().len();
    if pending > 0 {
        warn!("{} undelivered send(s) in the in-memory queue will be lost", pending);
    }
    connections.shutdown().await;
}
