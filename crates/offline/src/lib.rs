//! `erpsync-offline`
//!
//! **Responsibility:** offline-first write path of the mobile ERP client.
//!
//! This crate provides:
//! - a connectivity oracle (Unknown / Offline / Online) with subscribers
//! - a durable local record store and pending mutation queue (SQLite)
//! - a sync engine that replays queued writes in FIFO order once online
//! - a background worker that triggers sync cycles and publishes events
//! - per-entity gateways, the only write API the UI calls
//!
//! The remote API stays the authority: local records exist only until the
//! server has accepted (or rejected) them.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod gateway;
pub mod local_store;
pub mod queue;
pub mod remote;
pub mod sync_engine;
pub mod types;
pub mod worker;

pub use client::OfflineClient;
pub use config::{ConfigError, OfflineConfig, SyncPolicy};
pub use connectivity::{ConnectivityOracle, ConnectivityProbe, HttpHealthProbe, Subscription};
pub use db::Database;
pub use gateway::{
    CheckInGateway, CustomerGateway, EntityGateway, GatewayError, QuotationGateway, SalesOrderGateway,
    TaskGateway,
};
pub use local_store::{LocalRecordStore, StateCounts, StoreError};
pub use queue::{PendingMutationQueue, QueueBatch, QueueError, RetireOutcome};
pub use remote::{FailureClass, HttpRemoteApi, RemoteApi, RemoteError, RemoteRecord};
pub use sync_engine::{SyncEngine, SyncError, TriggerOutcome};
pub use types::{
    AbortReason, ConnectivityState, Fields, LocalRecord, MutationOperation, PendingMutation, RecordRef,
    RecordView, SyncReport, SyncState, WriteOutcome,
};
pub use worker::{SyncEvent, SyncWorker, WorkerHandle};
