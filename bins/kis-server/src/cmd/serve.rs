use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kis_api_server::AppState;
use kis_core::{
    ActiveSegment, Archiver, HealthChecker, Ingestor, RecordCodec, RemoteTarget, Rotator, Trigger, run_trigger_loop,
    spawn_inactivity_monitor,
};

use super::{build_object_store, connect_database};
use crate::config::ServeArgs;
use crate::error::ServerError;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("kis-server starting");

    // --- Config ---
    let config = args.effective()?;
    tracing::info!(config = %args.common.config, "loaded config");

    let token = CancellationToken::new();

    // --- Active file ---
    let active_path = config.file.active_path();
    let segment = Arc::new(
        ActiveSegment::open(&active_path, config.file.buffer_increment).map_err(|source| ServerError::Io {
            context: "open active file",
            path: active_path.display().to_string(),
            source,
        })?,
    );

    // --- Dependencies ---
    let store = if config.archive.enabled {
        Some(build_object_store(&config.archive)?)
    } else {
        None
    };
    let db = if config.database.enabled {
        Some(connect_database(&config.database).await?)
    } else {
        None
    };

    let health = Arc::new(HealthChecker::new(
        store.clone().map(|s| (s, config.archive.folder.clone())),
        db.clone(),
    ));
    let report = health.check(true).await;
    if !report.is_ok() {
        return Err(ServerError::Startup(report.to_string()));
    }
    tracing::info!(%report, "startup checks passed");

    // --- Pipeline ---
    let remote = store.map(|store| RemoteTarget {
        store,
        folder: config.archive.folder.clone(),
        remove_sent_file: config.archive.remove_sent_file,
    });
    let archiver = Arc::new(Archiver::new(remote, config.archive.compression_level));
    let rotator = Arc::new(Rotator::new(
        segment.clone(),
        archiver,
        config.file.rotate_interval,
        config.file.flush_min_records,
        config.file.max_name_probes,
    ));
    let codec = RecordCodec::new(config.file.timestamp_field.clone());
    let ingestor = Arc::new(Ingestor::new(db, rotator.clone(), codec));

    // --- Triggers ---
    let (trigger_tx, trigger_rx) = mpsc::channel::<Trigger>(8);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(tokio::spawn(run_trigger_loop(trigger_rx, rotator.clone(), token.clone())));

    if let Some(interval) = config.archive.inactivity_timeout() {
        handles.push(spawn_inactivity_monitor(segment.clone(), interval, trigger_tx.clone(), token.clone()));
        tracing::info!(interval_secs = interval.as_secs(), "inactivity monitor started");
    }

    #[cfg(unix)]
    handles.push(spawn_operator_signal(trigger_tx, token.clone())?);
    #[cfg(not(unix))]
    drop(trigger_tx);

    // --- API server ---
    let state = AppState::new(ingestor, health, config.server.timeout());
    let address = config.server.address.clone();
    let max_body_bytes = config.server.max_body_bytes;
    let api_token = token.clone();
    let mut api_handle =
        tokio::spawn(async move { kis_api_server::run(&address, state, max_body_bytes, api_token).await });

    tracing::info!(address = %config.server.address, "server ready");

    // --- Wait for shutdown ---
    let mut api_result = None;
    tokio::select! {
        signal = shutdown_signal() => signal?,
        joined = &mut api_handle => {
            api_result = Some(joined.map_err(|e| e.to_string()).and_then(|r| r));
        }
    }
    tracing::info!("shutting down...");
    token.cancel();

    // Текущие запросы дорабатывают до финального flush.
    let api_result = match api_result {
        Some(r) => r,
        None => match tokio::time::timeout(config.server.shutdown_grace(), &mut api_handle).await {
            Ok(joined) => joined.map_err(|e| e.to_string()).and_then(|r| r),
            Err(_) => {
                tracing::warn!("api server did not stop in time");
                api_handle.abort();
                Ok(())
            }
        },
    };

    for h in handles {
        let _ = h.await;
    }

    match rotator.flush().await {
        Ok(result) if result.happened => tracing::info!(file = %result.path.display(), "final flush archived"),
        Ok(_) => tracing::info!("nothing to flush"),
        Err(e) => tracing::error!(error = %e, "final flush failed"),
    }

    if !rotator.wait_detached(config.server.shutdown_grace()).await {
        tracing::warn!(in_flight = rotator.detached_in_flight(), "detached archival still running at exit");
    }

    tracing::info!("shutdown complete");
    api_result.map_err(ServerError::Api)
}

/// SIGINT или SIGTERM.
async fn shutdown_signal() -> Result<(), ServerError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).map_err(ServerError::signal("SIGTERM"))?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.map_err(ServerError::signal("SIGINT"))?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.map_err(ServerError::signal("SIGINT"))?;
    Ok(())
}

/// Пересылает SIGUSR1 как [`Trigger::Operator`].
#[cfg(unix)]
fn spawn_operator_signal(tx: mpsc::Sender<Trigger>, token: CancellationToken) -> Result<JoinHandle<()>, ServerError> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut usr1 = signal(SignalKind::user_defined1()).map_err(ServerError::signal("SIGUSR1"))?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("SIGUSR1 received, flushing active file");
                    if tx.send(Trigger::Operator).await.is_err() {
                        break;
                    }
                }
            }
        }
    }))
}
