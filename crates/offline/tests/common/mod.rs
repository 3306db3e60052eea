#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use erpsync_core::EntityType;
use erpsync_offline::{
    Database, Fields, OfflineClient, RemoteApi, RemoteError, RemoteRecord, SyncPolicy,
};
use serde_json::Value;

/// One request the fake server received.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub entity: EntityType,
    pub remote_id: Option<String>,
    pub payload: Fields,
}

type Hook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    calls: Vec<RemoteCall>,
    failures: VecDeque<RemoteError>,
    rejections: Vec<(String, Value, String)>,
    docs: Vec<(EntityType, RemoteRecord)>,
    next_name: u32,
    after_call: Option<Hook>,
}

/// In-process stand-in for the ERP REST API.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next write with `err` (queued; one error per write).
    pub fn fail_next(&self, err: RemoteError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// Reject, as a validation error, any write whose `field` equals `value`.
    pub fn reject_when(&self, field: &str, value: Value, message: &str) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .push((field.to_string(), value, message.to_string()));
    }

    /// Run `hook(n)` after the n-th write (1-based) has been answered.
    pub fn after_call(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        self.state.lock().unwrap().after_call = Some(Arc::new(hook));
    }

    /// Seed a document that exists only on the server.
    pub fn seed(&self, entity: EntityType, name: &str, mut fields: Fields) {
        fields.insert("name".into(), Value::String(name.to_string()));
        self.state.lock().unwrap().docs.push((
            entity,
            RemoteRecord {
                remote_id: name.to_string(),
                fields,
            },
        ));
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn write(&self, entity: EntityType, remote_id: Option<&str>, payload: &Fields) -> Result<String, RemoteError> {
        let (result, n, hook) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(RemoteCall {
                entity,
                remote_id: remote_id.map(str::to_string),
                payload: payload.clone(),
            });
            let n = state.calls.len();

            let result = if let Some(err) = state.failures.pop_front() {
                Err(err)
            } else if let Some((_, _, message)) = state
                .rejections
                .iter()
                .find(|(field, value, _)| payload.get(field) == Some(value))
            {
                Err(RemoteError::status(417, message.clone()))
            } else if let Some(name) = remote_id {
                Ok(name.to_string())
            } else {
                state.next_name += 1;
                let name = format!("{}-{:04}", entity.doctype().to_uppercase().replace(' ', "-"), state.next_name);
                let mut fields = payload.clone();
                fields.insert("name".into(), Value::String(name.clone()));
                state.docs.push((
                    entity,
                    RemoteRecord {
                        remote_id: name.clone(),
                        fields,
                    },
                ));
                Ok(name)
            };
            (result, n, state.after_call.clone())
        };

        if let Some(hook) = hook {
            hook(n);
        }
        result
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(&self, entity: EntityType, payload: &Fields) -> Result<String, RemoteError> {
        self.write(entity, None, payload)
    }

    async fn update(&self, entity: EntityType, remote_id: &str, payload: &Fields) -> Result<String, RemoteError> {
        self.write(entity, Some(remote_id), payload)
    }

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>, RemoteError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .docs
            .iter()
            .filter(|(e, _)| *e == entity)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

pub type TestClient = OfflineClient<Arc<FakeRemote>>;

pub async fn client_with(db: Database, remote: Arc<FakeRemote>, policy: SyncPolicy) -> TestClient {
    OfflineClient::new(db, remote, policy)
}

pub async fn memory_client(remote: Arc<FakeRemote>) -> TestClient {
    client_with(Database::in_memory().await.unwrap(), remote, SyncPolicy::default()).await
}

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}
