//! `erpsync-agent`: headless sync agent.
//!
//! Opens the offline database, probes the API and replays queued writes
//! whenever it is reachable. Configuration comes from `ERPSYNC_*`
//! environment variables; `ERPSYNC_LOG_FORMAT=pretty` switches log output.

use anyhow::Context;
use erpsync_observability::LogFormat;
use erpsync_offline::{OfflineClient, OfflineConfig, SyncEvent};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("ERPSYNC_LOG_FORMAT")
        .map(|name| LogFormat::from_name(&name))
        .unwrap_or_default();
    erpsync_observability::tracing::init(format);

    let config = OfflineConfig::from_env().context("invalid ERPSYNC_* configuration")?;
    let client = OfflineClient::from_config(&config)
        .await
        .context("failed to initialise offline client")?;

    let pending = client.pending_uploads().await?;
    tracing::info!(
        pending = pending.mutations.len(),
        corrupt = pending.corrupt.len(),
        "sync agent starting"
    );

    let handle = client.worker().start();
    let mut events = handle.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                tracing::info!("shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "sync event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await.context("sync worker panicked")?;
    client.database().close().await;
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::ConnectivityChanged { state } => tracing::info!(?state, "connectivity"),
        SyncEvent::CycleCompleted {
            synced,
            failed,
            retried,
            corrupt,
            aborted,
        } => tracing::info!(synced, failed, retried, corrupt, ?aborted, "sync cycle completed"),
        SyncEvent::RecordFailed {
            mutation_id,
            entity_type,
            error,
        } => tracing::error!(%mutation_id, %entity_type, %error, "record rejected by server"),
        SyncEvent::CycleError { error } => tracing::error!(%error, "sync cycle error"),
    }
}
