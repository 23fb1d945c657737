use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use docket::config::Config;
use docket::engine::Engine;
use docket::maintenance;
use docket::notify::NotifyHub;

/// Hand every committed notice to the outside world. Here that is the log;
/// mail or webhook delivery would subscribe the same way.
async fn dispatch_notices(hub: Arc<NotifyHub>) {
    let mut rx = hub.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(notice) => match notice.to_json() {
                Ok(payload) => info!(target: "docket::dispatch", "{payload}"),
                Err(e) => tracing::error!("could not render notice: {e}"),
            },
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("notice dispatcher fell behind, {missed} notices dropped")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    docket::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(config.journal_path(), notify.clone())?.with_lock_timeout(config.lock_timeout),
    );

    info!("docket started");
    info!("  journal: {}", config.journal_path().display());
    info!("  providers loaded: {}", engine.list_providers().len());
    info!(
        "  lock timeout: {}",
        config
            .lock_timeout
            .map_or("none".to_string(), |t| format!("{}ms", t.as_millis()))
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    tokio::spawn(dispatch_notices(notify));
    tokio::spawn(maintenance::run_compactor(engine.clone(), config.compact_threshold));
    match config.no_show_grace_ms {
        Some(grace) => {
            info!("  no-show sweep: every {:?}, grace {grace}ms", config.sweep_interval);
            tokio::spawn(maintenance::run_no_show_sweeper(
                engine.clone(),
                grace,
                config.sweep_interval,
            ));
        }
        None => info!("  no-show sweep: disabled"),
    }

    shutdown_signal().await?;
    info!("shutdown signal received, compacting journal");
    if let Err(e) = engine.compact_wal().await {
        tracing::error!("final compaction failed: {e}");
    }

    info!("docket stopped");
    Ok(())
}
