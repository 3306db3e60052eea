//! Shared types for the offline write path.
//!
//! These are plain data: no I/O, no locking. Persistence lives in
//! `local_store` / `queue`, transport in `remote`.

use chrono::{DateTime, Utc};
use erpsync_core::{EntityType, LocalId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name → value mapping, shaped exactly like the remote API body.
pub type Fields = Map<String, Value>;

/// Reachability of the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// No probe has completed yet. Callers must not guess a write path.
    #[default]
    Unknown,
    /// Network unreachable or API unavailable.
    Offline,
    /// Online and connected to the API.
    Online,
}

impl ConnectivityState {
    /// Map the platform's opaque reachability signal.
    pub fn from_reachability(reachable: Option<bool>) -> Self {
        match reachable {
            None => ConnectivityState::Unknown,
            Some(false) => ConnectivityState::Offline,
            Some(true) => ConnectivityState::Online,
        }
    }

    pub fn is_online(&self) -> bool {
        *self == ConnectivityState::Online
    }
}

/// Sync lifecycle of a locally created record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "Pending",
            SyncState::Synced => "Synced",
            SyncState::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(SyncState::Pending),
            "Synced" => Some(SyncState::Synced),
            "Failed" => Some(SyncState::Failed),
            _ => None,
        }
    }

    /// Transitions are monotonic: Pending → {Synced | Failed}, never back.
    ///
    /// Self-transitions are allowed (field patches, repeated failure notes).
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        matches!(
            (self, next),
            (SyncState::Pending, _)
                | (SyncState::Synced, SyncState::Synced)
                | (SyncState::Failed, SyncState::Failed)
        )
    }
}

/// Kind of deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Create,
    Update,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "Create",
            MutationOperation::Update => "Update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(MutationOperation::Create),
            "Update" => Some(MutationOperation::Update),
            _ => None,
        }
    }
}

/// A write accepted while offline, waiting to be replayed against the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Never reused, even after removal. For creates this is also the
    /// `local_id` of the record it produced.
    pub id: LocalId,
    pub entity_type: EntityType,
    pub operation: MutationOperation,
    /// Target document for updates; `None` for creates.
    pub remote_id: Option<String>,
    pub payload: Fields,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    pub fn create(id: LocalId, entity_type: EntityType, payload: Fields) -> Self {
        Self {
            id,
            entity_type,
            operation: MutationOperation::Create,
            remote_id: None,
            payload,
            created_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    pub fn update(entity_type: EntityType, remote_id: impl Into<String>, payload: Fields) -> Self {
        Self {
            id: LocalId::new(),
            entity_type,
            operation: MutationOperation::Update,
            remote_id: Some(remote_id.into()),
            payload,
            created_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }
}

/// Locally persisted representation of a record created while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub local_id: LocalId,
    pub entity_type: EntityType,
    pub fields: Fields,
    pub sync_state: SyncState,
    /// Server-assigned name; always set once `sync_state` is `Synced`.
    pub remote_id: Option<String>,
    /// Why the record ended up `Failed`.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    /// A freshly accepted offline record.
    pub fn pending(local_id: LocalId, entity_type: EntityType, fields: Fields) -> Self {
        let now = Utc::now();
        Self {
            local_id,
            entity_type,
            fields,
            sync_state: SyncState::Pending,
            remote_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// String value of a field, if present.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Identifier handed back to the UI after a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RecordRef {
    /// Accepted locally; the server name is not known yet.
    Local(LocalId),
    /// Written through to the server.
    Remote(String),
}

/// Result of a gateway write.
///
/// Normal offline acceptance is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub offline: bool,
    pub id: RecordRef,
}

impl WriteOutcome {
    pub fn online(remote_id: String) -> Self {
        Self {
            offline: false,
            id: RecordRef::Remote(remote_id),
        }
    }

    pub fn deferred(local_id: LocalId) -> Self {
        Self {
            offline: true,
            id: RecordRef::Local(local_id),
        }
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match &self.id {
            RecordRef::Local(id) => Some(*id),
            RecordRef::Remote(_) => None,
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match &self.id {
            RecordRef::Remote(id) => Some(id),
            RecordRef::Local(_) => None,
        }
    }
}

/// One row of a merged "my records" list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub local_id: Option<LocalId>,
    pub remote_id: Option<String>,
    pub sync_state: SyncState,
    pub fields: Fields,
    pub last_error: Option<String>,
}

impl RecordView {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Why a sync cycle stopped before the queue was empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "state")]
pub enum AbortReason {
    /// The cycle was triggered while not online.
    NotOnline(ConnectivityState),
    /// Connectivity dropped between two queue items (or a re-probe failed).
    ConnectionLost,
    /// A retriable failure at the head of the queue; later items wait.
    TransientFailure,
}

/// A mutation the server accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedEntry {
    pub mutation_id: LocalId,
    pub entity_type: EntityType,
    pub operation: MutationOperation,
    pub remote_id: String,
}

/// A mutation abandoned after a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub mutation_id: LocalId,
    pub entity_type: EntityType,
    pub operation: MutationOperation,
    pub error: String,
}

/// A mutation left in the queue after a transient failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetriedEntry {
    pub mutation_id: LocalId,
    pub attempt_count: u32,
    pub error: String,
}

/// A persisted queue row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCorruption {
    /// Queue position of the row.
    pub seq: i64,
    /// Raw id column (may itself be the unreadable part).
    pub raw_id: String,
    pub reason: String,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Number of requests actually sent to the remote API.
    pub remote_calls: usize,
    pub synced: Vec<SyncedEntry>,
    pub failed: Vec<FailedEntry>,
    pub retried: Vec<RetriedEntry>,
    pub corrupt: Vec<QueueCorruption>,
    pub aborted: Option<AbortReason>,
}

impl SyncReport {
    pub(crate) fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            remote_calls: 0,
            synced: Vec::new(),
            failed: Vec::new(),
            retried: Vec::new(),
            corrupt: Vec::new(),
            aborted: None,
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    /// True when the cycle ran to completion without retriable failures.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_none() && self.retried.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_is_monotonic() {
        use SyncState::*;
        assert!(Pending.can_transition_to(Synced));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Pending));
        assert!(Synced.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(Pending));
        assert!(!Synced.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Synced));
    }

    #[test]
    fn reachability_maps_to_tri_state() {
        assert_eq!(ConnectivityState::from_reachability(None), ConnectivityState::Unknown);
        assert_eq!(ConnectivityState::from_reachability(Some(false)), ConnectivityState::Offline);
        assert_eq!(ConnectivityState::from_reachability(Some(true)), ConnectivityState::Online);
        assert_eq!(ConnectivityState::default(), ConnectivityState::Unknown);
    }

    #[test]
    fn state_names_round_trip_through_storage_strings() {
        for s in [SyncState::Pending, SyncState::Synced, SyncState::Failed] {
            assert_eq!(SyncState::parse(s.as_str()), Some(s));
        }
        assert_eq!(SyncState::parse("pending"), None);
        assert_eq!(MutationOperation::parse("Update"), Some(MutationOperation::Update));
    }

    #[test]
    fn write_outcome_exposes_the_matching_id() {
        let local = LocalId::new();
        let deferred = WriteOutcome::deferred(local);
        assert!(deferred.offline);
        assert_eq!(deferred.local_id(), Some(local));
        assert_eq!(deferred.remote_id(), None);

        let online = WriteOutcome::online("CUST-0001".into());
        assert!(!online.offline);
        assert_eq!(online.remote_id(), Some("CUST-0001"));
    }
}
