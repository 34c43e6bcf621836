//! Watchtower daemon entry point.
//!
//! Opens the config file, starts the config engine and the ICMP detector,
//! then runs until SIGINT or SIGTERM. A status reporter and a secret key
//! listener run alongside and stop on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use watchtower_core::icmp::{IcmpDetector, LogNotifier};
use watchtower_core::ConfigStore;
use watchtower_storage::FileStore;

use watchtower_daemon::config::DaemonConfig;
use watchtower_daemon::hardening;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env();

    // Runs before logging exists, so warnings go to stderr.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(config_file = %config.config_file.display(), "Watchtower starting");

    let file = FileStore::open(&config.config_file)
        .await
        .with_context(|| format!("failed to open {}", config.config_file.display()))?;
    let store = ConfigStore::spawn(Arc::new(file), config.store_options())
        .await
        .context("failed to start config engine")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (key_tx, key_rx) = mpsc::channel(1);
    store
        .register_key_update_listener(key_tx)
        .await
        .context("failed to register key listener")?;
    let key_watcher = tokio::spawn(key_update_worker(key_rx, shutdown_rx.clone()));

    unlock_secrets(&store, &config).await;

    let notifier = Arc::new(LogNotifier);
    let detector = IcmpDetector::start(
        config.detector.clone(),
        store.clone(),
        notifier.clone(),
        notifier,
    )
    .await
    .context("failed to start ICMP detector")?;
    let detector = Arc::new(detector);

    for service in config.services.iter().cloned() {
        detector.add_service(service).await;
    }

    let reporter = tokio::spawn(status_reporter(
        Arc::clone(&detector),
        config.status_interval,
        shutdown_rx,
    ));

    shutdown_signal(shutdown_tx).await;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(config.shutdown_timeout, reporter).await;
    let _ = tokio::time::timeout(config.shutdown_timeout, key_watcher).await;
    drop(detector);

    if tokio::time::timeout(config.shutdown_timeout, store.shutdown())
        .await
        .is_err()
    {
        warn!("config engine did not stop in time");
    }

    info!("Watchtower stopped");
    Ok(())
}

/// Apply the configured passphrase, if any. A rejected key is logged and
/// the daemon keeps running with secrets locked.
async fn unlock_secrets(store: &ConfigStore, config: &DaemonConfig) {
    let Some(passphrase) = config.secret_key.as_deref() else {
        info!("no secret key configured, secrets stay locked until one is set");
        return;
    };
    match store.set_secret_key(passphrase).await {
        Ok(()) => info!("[SEC-INFO] secret key accepted"),
        Err(e) => warn!(error = %e, code = e.code(), "[SEC-INFO] secret key rejected"),
    }
}

/// Log every secret key change until shutdown.
async fn key_update_worker(mut updates: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            update = updates.recv() => {
                if update.is_none() {
                    debug!("key update channel closed");
                    return;
                }
                info!("[SEC-INFO] secret key updated, secrets are readable");
            }
            _ = shutdown.changed() => {
                info!("key update listener shutting down");
                return;
            }
        }
    }
}

/// Periodically log a summary of every monitored service.
async fn status_reporter(
    detector: Arc<IcmpDetector>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    info!(interval_secs = every.as_secs(), "status reporter started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let services = detector.get_services();
                let up = services.iter().filter(|s| s.alive).count();
                info!(total = services.len(), up, down = services.len() - up, "service status");
                for service in &services {
                    debug!(
                        address = %service.address,
                        service = %service.service_name,
                        alive = service.alive,
                        rtt_ms = service.rtt.as_secs_f64() * 1000.0,
                        detect_count = service.detect_count,
                        report_count = service.report_count,
                        "service detail"
                    );
                }
            }
            _ = shutdown.changed() => {
                info!("status reporter shutting down");
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

/// Uses `eprintln` because structured logging is not yet available.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &DaemonConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via WATCHTOWER_DISABLE_MLOCK, the secret key may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set WATCHTOWER_DISABLE_MLOCK=true for dev)");
    }
}
