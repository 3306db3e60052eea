//! Background sync worker.
//!
//! Owns the sync triggers:
//! - every connectivity transition into `Online` (immediately),
//! - a periodic timer while online, backing off exponentially after cycles
//!   that hit transient failures,
//! - a periodic connectivity probe, when one is configured.
//!
//! Outcomes are published as [`SyncEvent`]s on a broadcast channel.

use std::sync::Arc;

use erpsync_core::{EntityType, LocalId};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::MIN_INTERVAL;

use crate::connectivity::ConnectivityProbe;
use crate::remote::RemoteApi;
use crate::sync_engine::SyncEngine;
use crate::types::{AbortReason, ConnectivityState, SyncReport};

const EVENT_CAPACITY: usize = 64;

/// Sync status notification for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged {
        state: ConnectivityState,
    },
    CycleCompleted {
        synced: usize,
        failed: usize,
        retried: usize,
        corrupt: usize,
        aborted: Option<AbortReason>,
    },
    /// A write was rejected for good; the user has to look at it.
    RecordFailed {
        mutation_id: LocalId,
        entity_type: EntityType,
        error: String,
    },
    /// The cycle itself failed (local storage error).
    CycleError {
        error: String,
    },
}

pub struct SyncWorker<R> {
    engine: Arc<SyncEngine<R>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: Arc<Notify>,
}

impl<R: RemoteApi + 'static> SyncWorker<R> {
    /// Create a worker driving `engine`; probes with the engine's probe, if any.
    pub fn new(engine: Arc<SyncEngine<R>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let probe = engine.probe().cloned();
        Self {
            engine,
            probe,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Spawn the worker loop.
    pub fn start(self) -> WorkerHandle {
        let shutdown = self.shutdown.clone();
        let events = self.events.clone();
        let join = tokio::spawn(self.run());
        WorkerHandle {
            shutdown,
            events,
            join,
        }
    }

    async fn run(self) {
        let policy = self.engine.policy().clone();
        let oracle = self.engine.oracle().clone();

        let (tx, mut transitions) = mpsc::unbounded_channel();
        let _subscription = oracle.subscribe(move |state| {
            let _ = tx.send(state);
        });

        let mut probe_tick = self.probe.as_ref().map(|_| {
            let mut tick = tokio::time::interval(policy.probe_interval.max(MIN_INTERVAL));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick
        });
        let sync_interval = policy.sync_interval.max(MIN_INTERVAL);

        let mut consecutive_failures = 0u32;
        let mut next_sync = Instant::now() + sync_interval;

        tracing::info!(
            ?sync_interval,
            probe = self.probe.is_some(),
            "sync worker started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("sync worker received shutdown signal");
                    break;
                }
                Some(state) = transitions.recv() => {
                    let _ = self.events.send(SyncEvent::ConnectivityChanged { state });
                    if state.is_online() {
                        self.trigger(&mut consecutive_failures).await;
                        next_sync = Instant::now() + sync_interval + policy.backoff_for(consecutive_failures);
                    }
                }
                _ = next_probe(&mut probe_tick) => {
                    if let Some(probe) = &self.probe {
                        oracle.refresh(probe.as_ref()).await;
                    }
                }
                _ = tokio::time::sleep_until(next_sync) => {
                    if oracle.current_state().is_online() {
                        self.trigger(&mut consecutive_failures).await;
                    }
                    let backoff = policy.backoff_for(consecutive_failures);
                    if !backoff.is_zero() {
                        tracing::debug!(?backoff, consecutive_failures, "backing off periodic sync");
                    }
                    next_sync = Instant::now() + sync_interval + backoff;
                }
            }
        }

        tracing::info!("sync worker stopped");
    }

    async fn trigger(&self, consecutive_failures: &mut u32) {
        match self.engine.request_sync().await {
            Ok(outcome) => {
                for report in outcome.reports() {
                    self.publish(report);
                    if hit_transient_failure(report) {
                        *consecutive_failures += 1;
                    } else if report.aborted.is_none() {
                        *consecutive_failures = 0;
                    }
                }
            }
            Err(err) => {
                *consecutive_failures += 1;
                tracing::error!(error = %err, consecutive_failures, "sync cycle failed");
                let _ = self.events.send(SyncEvent::CycleError {
                    error: err.to_string(),
                });
            }
        }
    }

    fn publish(&self, report: &SyncReport) {
        for failed in &report.failed {
            let _ = self.events.send(SyncEvent::RecordFailed {
                mutation_id: failed.mutation_id,
                entity_type: failed.entity_type,
                error: failed.error.clone(),
            });
        }
        let _ = self.events.send(SyncEvent::CycleCompleted {
            synced: report.synced.len(),
            failed: report.failed.len(),
            retried: report.retried.len(),
            corrupt: report.corrupt.len(),
            aborted: report.aborted,
        });
    }
}

/// Next probe tick; never resolves when no probe is configured.
async fn next_probe(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn hit_transient_failure(report: &SyncReport) -> bool {
    !report.retried.is_empty() || report.aborted == Some(AbortReason::ConnectionLost)
}

/// Handle to a running [`SyncWorker`].
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    events: broadcast::Sender<SyncEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the worker to stop and wait for it. A cycle in progress completes first.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.shutdown.notify_one();
        self.join.await
    }
}
