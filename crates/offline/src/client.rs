//! Wiring of the offline write path.
//!
//! [`OfflineClient`] owns the one database, the one connectivity oracle and
//! the one store/queue pair; every gateway and the sync engine share them
//! (and therefore share their write locks).

use std::sync::Arc;

use anyhow::Context;
use erpsync_core::Entity;

use crate::config::{OfflineConfig, SyncPolicy};
use crate::connectivity::{ConnectivityOracle, ConnectivityProbe, HttpHealthProbe};
use crate::db::Database;
use crate::gateway::{
    CheckInGateway, CustomerGateway, EntityGateway, QuotationGateway, SalesOrderGateway, TaskGateway,
};
use crate::local_store::LocalRecordStore;
use crate::queue::{PendingMutationQueue, QueueBatch, QueueError};
use crate::remote::{HttpRemoteApi, RemoteApi};
use crate::sync_engine::{SyncEngine, SyncError, TriggerOutcome};
use crate::worker::SyncWorker;

/// Application-facing handle. Cheap to clone.
pub struct OfflineClient<R> {
    db: Database,
    store: LocalRecordStore,
    queue: PendingMutationQueue,
    oracle: Arc<ConnectivityOracle>,
    remote: Arc<R>,
    engine: Arc<SyncEngine<Arc<R>>>,
}

impl<R> Clone for OfflineClient<R> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            oracle: self.oracle.clone(),
            remote: self.remote.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<R: RemoteApi + 'static> OfflineClient<R> {
    pub fn new(db: Database, remote: R, policy: SyncPolicy) -> Self {
        let store = LocalRecordStore::new(&db);
        let queue = PendingMutationQueue::new(&db);
        let oracle = ConnectivityOracle::arc();
        let remote = Arc::new(remote);
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            oracle.clone(),
            remote.clone(),
            policy,
        ));

        Self {
            db,
            store,
            queue,
            oracle,
            remote,
            engine,
        }
    }

    /// Use `probe` for the worker's periodic checks and the engine's re-probe.
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.engine = Arc::new(
            SyncEngine::new(
                self.store.clone(),
                self.queue.clone(),
                self.oracle.clone(),
                self.remote.clone(),
                self.engine.policy().clone(),
            )
            .with_probe(probe),
        );
        self
    }

    pub fn gateway<E: Entity>(&self) -> EntityGateway<E, Arc<R>> {
        EntityGateway::new(
            self.store.clone(),
            self.queue.clone(),
            self.oracle.clone(),
            self.remote.clone(),
        )
    }

    pub fn customers(&self) -> CustomerGateway<Arc<R>> {
        self.gateway()
    }

    pub fn quotations(&self) -> QuotationGateway<Arc<R>> {
        self.gateway()
    }

    pub fn sales_orders(&self) -> SalesOrderGateway<Arc<R>> {
        self.gateway()
    }

    pub fn tasks(&self) -> TaskGateway<Arc<R>> {
        self.gateway()
    }

    pub fn check_ins(&self) -> CheckInGateway<Arc<R>> {
        self.gateway()
    }

    pub fn oracle(&self) -> &Arc<ConnectivityOracle> {
        &self.oracle
    }

    pub fn engine(&self) -> &Arc<SyncEngine<Arc<R>>> {
        &self.engine
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Background worker bound to this client's engine (not started).
    pub fn worker(&self) -> SyncWorker<Arc<R>> {
        SyncWorker::new(self.engine.clone())
    }

    /// Manual "sync now" from the UI.
    pub async fn sync_now(&self) -> Result<TriggerOutcome, SyncError> {
        self.engine.request_sync().await
    }

    /// Queued writes for a "pending uploads" screen, oldest first.
    pub async fn pending_uploads(&self) -> Result<QueueBatch, QueueError> {
        self.queue.list_all().await
    }
}

impl OfflineClient<HttpRemoteApi> {
    /// Open the database and build the HTTP remote and probe from `config`.
    pub async fn from_config(config: &OfflineConfig) -> anyhow::Result<Self> {
        let db = match &config.db_path {
            Some(path) => Database::open(path).await?,
            None => Database::open_default().await?,
        };

        let mut remote = HttpRemoteApi::new(config.api_url.clone(), config.request_timeout)
            .context("failed to build API client")?;
        if let Some(token) = &config.api_token {
            remote = remote.with_token(token.clone());
        }

        let probe = HttpHealthProbe::new(&config.api_url, &config.ping_path, config.request_timeout)
            .context("failed to build connectivity probe")?;

        tracing::info!(api_url = %config.api_url, probe_url = %probe.url(), "offline client configured");
        Ok(Self::new(db, remote, config.policy.clone()).with_probe(Arc::new(probe)))
    }
}
