//! Sync engine: replays the pending mutation queue against the remote API.
//!
//! One cycle at a time (guarded by the cycle mutex). A cycle:
//!
//! 1. refuses to start unless the connectivity oracle says `Online`,
//! 2. drains the queue oldest-first in batches of `batch_size`,
//! 3. re-checks the oracle before every item,
//! 4. submits each mutation and reconciles the local record with the
//!    server-assigned name,
//! 5. stops at the first transient failure so nothing is submitted ahead of
//!    an earlier retriable entry.
//!
//! Permanent failures mark the record `Failed` and drop the mutation; they
//! are never retried automatically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use erpsync_core::LocalId;
use tokio::sync::Mutex;

use crate::config::SyncPolicy;
use crate::connectivity::{ConnectivityOracle, ConnectivityProbe};
use crate::local_store::{LocalRecordStore, StoreError};
use crate::queue::{PendingMutationQueue, QueueError, RetireOutcome};
use crate::remote::{RemoteApi, RemoteError};
use crate::types::{
    AbortReason, FailedEntry, LocalRecord, MutationOperation, PendingMutation, QueueCorruption,
    RetriedEntry, SyncReport, SyncState, SyncedEntry,
};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("record {local_id} is {state:?}; only Failed records can be retried")]
    NotRetryable { local_id: LocalId, state: SyncState },
    #[error("record {0} is already synced and cannot be discarded")]
    NotDiscardable(LocalId),
}

/// Result of [`SyncEngine::request_sync`].
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// This caller ran the cycles (the first one plus any coalesced reruns).
    Ran(Vec<SyncReport>),
    /// A cycle was already being driven; it will run once more afterwards.
    Coalesced,
}

impl TriggerOutcome {
    pub fn reports(&self) -> &[SyncReport] {
        match self {
            TriggerOutcome::Ran(reports) => reports,
            TriggerOutcome::Coalesced => &[],
        }
    }
}

/// What happened to one queue item.
enum Step {
    Continue,
    Stop(AbortReason),
}

pub struct SyncEngine<R> {
    store: LocalRecordStore,
    queue: PendingMutationQueue,
    oracle: Arc<ConnectivityOracle>,
    remote: R,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    policy: SyncPolicy,
    cycle: Mutex<()>,
    draining: AtomicBool,
    rerun: AtomicBool,
}

impl<R> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("policy", &self.policy)
            .field("state", &self.oracle.current_state())
            .finish_non_exhaustive()
    }
}

impl<R: RemoteApi> SyncEngine<R> {
    pub fn new(
        store: LocalRecordStore,
        queue: PendingMutationQueue,
        oracle: Arc<ConnectivityOracle>,
        remote: R,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            oracle,
            remote,
            probe: None,
            policy,
            cycle: Mutex::new(()),
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    /// Re-probe connectivity after a transient failure.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn store(&self) -> &LocalRecordStore {
        &self.store
    }

    pub fn queue(&self) -> &PendingMutationQueue {
        &self.queue
    }

    pub fn oracle(&self) -> &Arc<ConnectivityOracle> {
        &self.oracle
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn probe(&self) -> Option<&Arc<dyn ConnectivityProbe>> {
        self.probe.as_ref()
    }

    /// Run exactly one cycle, waiting for any cycle in progress to finish.
    pub async fn run_sync_cycle(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self.cycle.lock().await;
        self.cycle_locked().await
    }

    /// Trigger entry point used by the worker and the UI.
    ///
    /// If another caller is already driving cycles, the request is folded
    /// into a single rerun after its current cycle and this call returns
    /// [`TriggerOutcome::Coalesced`] immediately.
    pub async fn request_sync(&self) -> Result<TriggerOutcome, SyncError> {
        self.rerun.store(true, Ordering::SeqCst);
        let mut reports = Vec::new();

        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::debug!("sync already running; request coalesced");
                return Ok(if reports.is_empty() {
                    TriggerOutcome::Coalesced
                } else {
                    TriggerOutcome::Ran(reports)
                });
            }

            let drained = self.drain_requests(&mut reports).await;
            self.draining.store(false, Ordering::SeqCst);
            drained?;

            // A request may have landed between the last check and the flag reset.
            if !self.rerun.load(Ordering::SeqCst) {
                return Ok(TriggerOutcome::Ran(reports));
            }
        }
    }

    async fn drain_requests(&self, reports: &mut Vec<SyncReport>) -> Result<(), SyncError> {
        while self.rerun.swap(false, Ordering::SeqCst) {
            reports.push(self.run_sync_cycle().await?);
        }
        Ok(())
    }

    /// Give a Failed record another chance.
    ///
    /// The record is re-accepted under a fresh id with a new Create mutation
    /// (sync state never moves backwards and mutation ids are never reused);
    /// the Failed record is removed. Returns the new local id.
    pub async fn retry_failed(&self, local_id: LocalId) -> Result<LocalId, SyncError> {
        let record = self.store.get(local_id).await?;
        if record.sync_state != SyncState::Failed {
            return Err(SyncError::NotRetryable {
                local_id,
                state: record.sync_state,
            });
        }

        let fresh = LocalRecord::pending(LocalId::new(), record.entity_type, record.fields);
        self.store.put(&fresh).await?;

        let mutation = PendingMutation::create(fresh.local_id, fresh.entity_type, fresh.fields.clone());
        if let Err(err) = self.queue.enqueue(&mutation).await {
            self.store.delete(fresh.local_id).await?;
            return Err(err.into());
        }
        self.store.delete(local_id).await?;

        tracing::info!(
            old_local_id = %local_id,
            new_local_id = %fresh.local_id,
            entity = %fresh.entity_type,
            "failed record re-queued"
        );
        Ok(fresh.local_id)
    }

    /// Drop a Pending or Failed record together with its queued mutation.
    pub async fn discard(&self, local_id: LocalId) -> Result<(), SyncError> {
        let _cycle = self.cycle.lock().await;

        let record = self.store.get(local_id).await?;
        if record.sync_state == SyncState::Synced {
            return Err(SyncError::NotDiscardable(local_id));
        }
        if self.queue.get(local_id).await?.is_some() {
            self.queue.remove(local_id, RetireOutcome::Abandoned).await?;
        }
        self.store.delete(local_id).await?;

        tracing::info!(%local_id, entity = %record.entity_type, "discarded local record");
        Ok(())
    }

    async fn cycle_locked(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::begin();

        let state = self.oracle.current_state();
        if !state.is_online() {
            tracing::debug!(?state, "skipping sync cycle: not online");
            report.aborted = Some(AbortReason::NotOnline(state));
            return Ok(report.finish());
        }

        'drain: loop {
            let batch = self.queue.peek_batch(self.policy.batch_size).await?;
            for entry in &batch.corrupt {
                self.quarantine(entry).await?;
            }
            report.corrupt.extend(batch.corrupt);

            if batch.mutations.is_empty() {
                break;
            }

            for mutation in batch.mutations {
                if !self.oracle.current_state().is_online() {
                    report.aborted = Some(AbortReason::ConnectionLost);
                    break 'drain;
                }
                if let Step::Stop(reason) = self.replay(&mutation, &mut report).await? {
                    report.aborted = Some(reason);
                    break 'drain;
                }
            }
        }

        let report = report.finish();
        tracing::info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            retried = report.retried.len(),
            corrupt = report.corrupt.len(),
            remote_calls = report.remote_calls,
            aborted = ?report.aborted,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Submit one mutation and settle its outcome.
    ///
    /// Any transient failure stops the cycle, even when the re-probe still
    /// says `Online`. A head entry that keeps getting 5xx answers therefore
    /// holds back everything queued after it for up to `max_attempts`
    /// cycles, until the ceiling turns it into a permanent failure.
    async fn replay(&self, mutation: &PendingMutation, report: &mut SyncReport) -> Result<Step, SyncError> {
        if mutation.operation == MutationOperation::Create {
            match self.store.get(mutation.id).await {
                Ok(record) => match record.sync_state {
                    // Crashed after the record was reconciled but before the
                    // mutation was removed.
                    SyncState::Synced => {
                        self.queue.remove(mutation.id, RetireOutcome::Applied).await?;
                        if let Some(remote_id) = record.remote_id {
                            report.synced.push(SyncedEntry {
                                mutation_id: mutation.id,
                                entity_type: mutation.entity_type,
                                operation: mutation.operation,
                                remote_id,
                            });
                        }
                        return Ok(Step::Continue);
                    }
                    SyncState::Failed => {
                        self.queue.remove(mutation.id, RetireOutcome::Abandoned).await?;
                        return Ok(Step::Continue);
                    }
                    SyncState::Pending => {}
                },
                Err(StoreError::NotFound(_)) => {
                    tracing::warn!(mutation_id = %mutation.id, "create mutation has no local record");
                }
                Err(err) => return Err(err.into()),
            }
        }

        report.remote_calls += 1;
        match self.submit(mutation).await {
            Ok(remote_id) => {
                self.apply_success(mutation, &remote_id).await?;
                report.synced.push(SyncedEntry {
                    mutation_id: mutation.id,
                    entity_type: mutation.entity_type,
                    operation: mutation.operation,
                    remote_id,
                });
                Ok(Step::Continue)
            }
            Err(err) if err.is_transient() => {
                let message = err.to_string();
                let attempts = self.queue.mark_attempt(mutation.id, Some(&message)).await?;
                if self.policy.exceeds_ceiling(attempts) {
                    let message = format!("gave up after {attempts} attempts: {message}");
                    self.apply_failure(mutation, message, report).await?;
                    return Ok(Step::Continue);
                }

                tracing::warn!(
                    mutation_id = %mutation.id,
                    entity = %mutation.entity_type,
                    attempts,
                    error = %message,
                    "transient sync failure; will retry"
                );
                report.retried.push(RetriedEntry {
                    mutation_id: mutation.id,
                    attempt_count: attempts,
                    error: message,
                });
                Ok(Step::Stop(self.reprobe().await))
            }
            Err(err) => {
                self.apply_failure(mutation, err.to_string(), report).await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn submit(&self, mutation: &PendingMutation) -> Result<String, RemoteError> {
        match mutation.operation {
            MutationOperation::Create => self.remote.create(mutation.entity_type, &mutation.payload).await,
            MutationOperation::Update => {
                let remote_id = mutation
                    .remote_id
                    .as_deref()
                    .ok_or_else(|| RemoteError::Rejected("update without remote id".to_string()))?;
                self.remote
                    .update(mutation.entity_type, remote_id, &mutation.payload)
                    .await
            }
        }
    }

    async fn apply_success(&self, mutation: &PendingMutation, remote_id: &str) -> Result<(), SyncError> {
        if mutation.operation == MutationOperation::Create {
            match self.store.mark_synced(mutation.id, remote_id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.queue.remove(mutation.id, RetireOutcome::Applied).await?;
        tracing::debug!(
            mutation_id = %mutation.id,
            entity = %mutation.entity_type,
            remote_id,
            "mutation applied"
        );
        Ok(())
    }

    async fn apply_failure(
        &self,
        mutation: &PendingMutation,
        error: String,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        tracing::error!(
            mutation_id = %mutation.id,
            entity = %mutation.entity_type,
            operation = mutation.operation.as_str(),
            error = %error,
            "mutation rejected permanently"
        );
        if mutation.operation == MutationOperation::Create {
            match self.store.mark_failed(mutation.id, &error).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.queue.remove(mutation.id, RetireOutcome::Abandoned).await?;
        report.failed.push(FailedEntry {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type,
            operation: mutation.operation,
            error,
        });
        Ok(())
    }

    /// Drop an unreadable queue row; its record, if identifiable, is failed.
    async fn quarantine(&self, entry: &QueueCorruption) -> Result<(), SyncError> {
        self.queue.drop_corrupt(entry).await?;

        let Ok(local_id) = entry.raw_id.parse::<LocalId>() else {
            return Ok(());
        };
        let error = format!("queued write unreadable: {}", entry.reason);
        match self.store.mark_failed(local_id, &error).await {
            Ok(()) | Err(StoreError::NotFound(_)) | Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn reprobe(&self) -> AbortReason {
        let state = match &self.probe {
            Some(probe) => self.oracle.refresh(probe.as_ref()).await,
            None => self.oracle.current_state(),
        };
        if state.is_online() {
            AbortReason::TransientFailure
        } else {
            AbortReason::ConnectionLost
        }
    }
}
