//! Entity gateways: the only write path the UI calls.
//!
//! Each call snapshots the connectivity oracle once and picks a path:
//!
//! | state     | create / update                                   |
//! |-----------|---------------------------------------------------|
//! | `Online`  | straight to the remote API                        |
//! | `Offline` | local record (creates only) + queued mutation     |
//! | `Unknown` | refused with `ConnectivityIndeterminate`          |

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use erpsync_core::{CheckIn, Customer, DomainError, DomainResult, Entity, LocalId, Quotation, SalesOrder, Task};
use serde_json::Value;

use crate::connectivity::ConnectivityOracle;
use crate::local_store::{LocalRecordStore, StateCounts, StoreError};
use crate::queue::{PendingMutationQueue, QueueError};
use crate::remote::{RemoteApi, RemoteError, RemoteRecord};
use crate::types::{
    ConnectivityState, Fields, LocalRecord, PendingMutation, RecordView, SyncState, WriteOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("connectivity is not known yet; no write path can be chosen")]
    ConnectivityIndeterminate,
    #[error(transparent)]
    InvalidPayload(#[from] DomainError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type CustomerGateway<R> = EntityGateway<Customer, R>;
pub type QuotationGateway<R> = EntityGateway<Quotation, R>;
pub type SalesOrderGateway<R> = EntityGateway<SalesOrder, R>;
pub type TaskGateway<R> = EntityGateway<Task, R>;
pub type CheckInGateway<R> = EntityGateway<CheckIn, R>;

/// Create/update/list for one entity type.
pub struct EntityGateway<E, R> {
    store: LocalRecordStore,
    queue: PendingMutationQueue,
    oracle: Arc<ConnectivityOracle>,
    remote: R,
    _entity: PhantomData<fn() -> E>,
}

impl<E, R: Clone> Clone for EntityGateway<E, R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            oracle: self.oracle.clone(),
            remote: self.remote.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity, R: RemoteApi> EntityGateway<E, R> {
    pub fn new(
        store: LocalRecordStore,
        queue: PendingMutationQueue,
        oracle: Arc<ConnectivityOracle>,
        remote: R,
    ) -> Self {
        Self {
            store,
            queue,
            oracle,
            remote,
            _entity: PhantomData,
        }
    }

    /// Create a record.
    ///
    /// Offline acceptance is a normal outcome (`offline: true`), not an error.
    pub async fn create(&self, fields: Value) -> Result<WriteOutcome, GatewayError> {
        let fields = into_fields::<E>(fields)?;

        match self.oracle.current_state() {
            ConnectivityState::Unknown => Err(GatewayError::ConnectivityIndeterminate),
            ConnectivityState::Online => {
                let remote_id = self.remote.create(E::ENTITY_TYPE, &fields).await?;
                tracing::debug!(entity = %E::ENTITY_TYPE, %remote_id, "created remotely");
                Ok(WriteOutcome::online(remote_id))
            }
            ConnectivityState::Offline => {
                let local_id = LocalId::new();
                let record = LocalRecord::pending(local_id, E::ENTITY_TYPE, fields.clone());
                self.store.put(&record).await?;

                let mutation = PendingMutation::create(local_id, E::ENTITY_TYPE, fields);
                if let Err(err) = self.queue.enqueue(&mutation).await {
                    // No Pending record may exist without its mutation.
                    if let Err(cleanup) = self.store.delete(local_id).await {
                        tracing::error!(%local_id, error = %cleanup, "failed to roll back local record");
                    }
                    return Err(err.into());
                }

                tracing::info!(
                    entity = %E::ENTITY_TYPE,
                    %local_id,
                    title = record.field_str(E::TITLE_FIELD).unwrap_or_default(),
                    "accepted offline create"
                );
                Ok(WriteOutcome::deferred(local_id))
            }
        }
    }

    /// Update an existing server document.
    ///
    /// Offline updates are queued without a local record; the returned
    /// local id is the mutation's.
    pub async fn update(&self, remote_id: &str, fields: Value) -> Result<WriteOutcome, GatewayError> {
        let fields = into_fields::<E>(fields)?;
        if remote_id.trim().is_empty() {
            return Err(DomainError::validation("update needs the document's remote id").into());
        }

        match self.oracle.current_state() {
            ConnectivityState::Unknown => Err(GatewayError::ConnectivityIndeterminate),
            ConnectivityState::Online => {
                let name = self.remote.update(E::ENTITY_TYPE, remote_id, &fields).await?;
                Ok(WriteOutcome::online(name))
            }
            ConnectivityState::Offline => {
                let mutation = PendingMutation::update(E::ENTITY_TYPE, remote_id, fields);
                self.queue.enqueue(&mutation).await?;
                tracing::info!(entity = %E::ENTITY_TYPE, %remote_id, mutation_id = %mutation.id, "accepted offline update");
                Ok(WriteOutcome::deferred(mutation.id))
            }
        }
    }

    /// "My records": remote documents merged with local ones.
    ///
    /// Falls back to local records only when not online or when the remote
    /// list fails.
    pub async fn list(&self) -> Result<Vec<RecordView>, GatewayError> {
        let local = self.store.list(E::ENTITY_TYPE).await?;

        let remote = if self.oracle.current_state().is_online() {
            match self.remote.list(E::ENTITY_TYPE).await {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(entity = %E::ENTITY_TYPE, error = %err, "remote list failed; showing local records only");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(merge_views(remote, local))
    }

    /// Local records that were rejected and need attention.
    pub async fn failed(&self) -> Result<Vec<LocalRecord>, GatewayError> {
        Ok(self
            .store
            .list_by_state(E::ENTITY_TYPE, &[SyncState::Failed])
            .await?)
    }

    pub async fn counts(&self) -> Result<StateCounts, GatewayError> {
        Ok(self.store.count_by_state(E::ENTITY_TYPE).await?)
    }

    /// Display title of a listed record.
    pub fn title<'a>(&self, view: &'a RecordView) -> Option<&'a str> {
        view.field_str(E::TITLE_FIELD)
    }
}

fn into_fields<E: Entity>(value: Value) -> DomainResult<Fields> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(DomainError::validation(format!(
            "{} payload must be a JSON object, got {}",
            E::ENTITY_TYPE,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Remote documents first (server fields win), then local records the
/// server does not list; each remote id appears once.
fn merge_views(remote: Vec<RemoteRecord>, local: Vec<LocalRecord>) -> Vec<RecordView> {
    let by_remote_id: HashMap<&str, &LocalRecord> = local
        .iter()
        .filter_map(|r| r.remote_id.as_deref().map(|id| (id, r)))
        .collect();

    let mut seen = HashSet::new();
    let mut views = Vec::with_capacity(remote.len() + local.len());

    for doc in remote {
        if !seen.insert(doc.remote_id.clone()) {
            continue;
        }
        let local_id = by_remote_id.get(doc.remote_id.as_str()).map(|r| r.local_id);
        views.push(RecordView {
            local_id,
            remote_id: Some(doc.remote_id),
            sync_state: SyncState::Synced,
            fields: doc.fields,
            last_error: None,
        });
    }

    for record in &local {
        if let Some(remote_id) = &record.remote_id {
            if !seen.insert(remote_id.clone()) {
                continue;
            }
        }
        views.push(RecordView {
            local_id: Some(record.local_id),
            remote_id: record.remote_id.clone(),
            sync_state: record.sync_state,
            fields: record.fields.clone(),
            last_error: record.last_error.clone(),
        });
    }

    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use erpsync_core::EntityType;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn remote(id: &str, name: &str) -> RemoteRecord {
        RemoteRecord {
            remote_id: id.to_string(),
            fields: fields(json!({"name": id, "customer_name": name})),
        }
    }

    #[test]
    fn merge_deduplicates_by_remote_id() {
        let mut synced = LocalRecord::pending(LocalId::new(), EntityType::Customer, fields(json!({"customer_name": "Acme"})));
        synced.sync_state = SyncState::Synced;
        synced.remote_id = Some("CUST-0001".into());
        let pending = LocalRecord::pending(LocalId::new(), EntityType::Customer, fields(json!({"customer_name": "Globex"})));

        let views = merge_views(
            vec![remote("CUST-0001", "Acme Ltd"), remote("CUST-0002", "Initech"), remote("CUST-0001", "Acme Ltd")],
            vec![synced.clone(), pending.clone()],
        );

        assert_eq!(views.len(), 3);
        assert_eq!(views[0].local_id, Some(synced.local_id));
        assert_eq!(views[0].field_str("customer_name"), Some("Acme Ltd"));
        assert_eq!(views[1].local_id, None);
        assert_eq!(views[2].local_id, Some(pending.local_id));
        assert_eq!(views[2].sync_state, SyncState::Pending);
    }

    #[test]
    fn synced_records_missing_remotely_are_still_listed() {
        let mut synced = LocalRecord::pending(LocalId::new(), EntityType::Task, Fields::new());
        synced.sync_state = SyncState::Synced;
        synced.remote_id = Some("TASK-7".into());

        let views = merge_views(Vec::new(), vec![synced]);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].remote_id.as_deref(), Some("TASK-7"));
    }

    #[test]
    fn payload_must_be_an_object() {
        let err = into_fields::<Customer>(json!(["Acme"])).unwrap_err();
        assert_eq!(
            err,
            DomainError::validation("customer payload must be a JSON object, got an array")
        );
        assert!(into_fields::<Customer>(json!({"customer_name": "Acme"})).is_ok());
    }
}
