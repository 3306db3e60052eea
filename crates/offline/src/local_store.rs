//! Durable store for records created while offline.
//!
//! Rows live in the `local_records` table of the offline database. Every
//! mutating operation takes the store's write lock and runs in a
//! transaction, so a sync cycle and a UI write never interleave on the same
//! record. Sync-state changes are checked against
//! [`SyncState::can_transition_to`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use erpsync_core::{EntityType, LocalId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;

use crate::db::Database;
use crate::types::{Fields, LocalRecord, SyncState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("local record not found: {0}")]
    NotFound(LocalId),
    #[error("invalid sync state transition for {local_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        local_id: LocalId,
        from: SyncState,
        to: SyncState,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt local record: {0}")]
    Serialization(String),
}

/// Per-state record counts (UI badges).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

/// SQLite-backed local record store.
///
/// This struct is cheap to clone and is safe to share across tasks; clones
/// share the same write lock.
#[derive(Debug, Clone)]
pub struct LocalRecordStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT local_id, entity_type, fields, sync_state, remote_id, last_error, created_at, updated_at
    FROM local_records
"#;

impl LocalRecordStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Insert or replace a record.
    ///
    /// Replacing an existing record must respect monotonic sync state; the
    /// original insertion position is kept.
    pub async fn put(&self, record: &LocalRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if let Some(current) = fetch_state(&mut tx, record.local_id).await? {
            if !current.can_transition_to(record.sync_state) {
                return Err(StoreError::InvalidTransition {
                    local_id: record.local_id,
                    from: current,
                    to: record.sync_state,
                });
            }
        }
        check_synced_has_remote(record.local_id, record.sync_state, record.remote_id.as_deref())?;

        sqlx::query(
            r#"
            INSERT INTO local_records (
                local_id, entity_type, fields, sync_state, remote_id, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (local_id) DO UPDATE SET
                entity_type = excluded.entity_type,
                fields      = excluded.fields,
                sync_state  = excluded.sync_state,
                remote_id   = excluded.remote_id,
                last_error  = excluded.last_error,
                updated_at  = excluded.updated_at
            "#,
        )
        .bind(record.local_id.to_string())
        .bind(record.entity_type.as_str())
        .bind(encode_fields(&record.fields)?)
        .bind(record.sync_state.as_str())
        .bind(record.remote_id.as_deref())
        .bind(record.last_error.as_deref())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(local_id = %record.local_id, entity = %record.entity_type, "stored local record");
        Ok(())
    }

    pub async fn get(&self, local_id: LocalId) -> Result<LocalRecord, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE local_id = ?1"))
            .bind(local_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(local_id))?;
        row_to_record(&row)
    }

    /// Merge `patch` into the record's fields (last writer wins per field).
    pub async fn update(&self, local_id: LocalId, patch: &Fields) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT fields FROM local_records WHERE local_id = ?1")
            .bind(local_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(local_id))?;

        let mut fields = decode_fields(&row.try_get::<String, _>("fields")?)?;
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }

        sqlx::query("UPDATE local_records SET fields = ?2, updated_at = ?3 WHERE local_id = ?1")
            .bind(local_id.to_string())
            .bind(encode_fields(&fields)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Records of one entity type, in insertion order.
    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<LocalRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE entity_type = ?1 ORDER BY seq ASC"))
            .bind(entity_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Records of one entity type in any of `states`, in insertion order.
    pub async fn list_by_state(
        &self,
        entity_type: EntityType,
        states: &[SyncState],
    ) -> Result<Vec<LocalRecord>, StoreError> {
        Ok(self
            .list(entity_type)
            .await?
            .into_iter()
            .filter(|r| states.contains(&r.sync_state))
            .collect())
    }

    pub async fn count_by_state(&self, entity_type: EntityType) -> Result<StateCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT sync_state, COUNT(*) AS n FROM local_records WHERE entity_type = ?1 GROUP BY sync_state",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("sync_state")?;
            let n = row.try_get::<i64, _>("n")? as usize;
            match SyncState::parse(&state) {
                Some(SyncState::Pending) => counts.pending = n,
                Some(SyncState::Synced) => counts.synced = n,
                Some(SyncState::Failed) => counts.failed = n,
                None => tracing::warn!(state = %state, "ignoring unknown sync_state in local_records"),
            }
        }
        Ok(counts)
    }

    /// Remove a record. Deleting an absent record is a no-op.
    pub async fn delete(&self, local_id: LocalId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM local_records WHERE local_id = ?1")
            .bind(local_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pending → Synced with the server-assigned name.
    ///
    /// Repeating the call with the same name is a no-op, so a replay after a
    /// crash between "record synced" and "mutation removed" is harmless.
    pub async fn mark_synced(&self, local_id: LocalId, remote_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT sync_state, remote_id FROM local_records WHERE local_id = ?1")
            .bind(local_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(local_id))?;
        let current = parse_state(&row.try_get::<String, _>("sync_state")?)?;
        let current_remote: Option<String> = row.try_get("remote_id")?;

        match current {
            SyncState::Synced if current_remote.as_deref() == Some(remote_id) => return Ok(()),
            SyncState::Pending => {}
            from => {
                return Err(StoreError::InvalidTransition {
                    local_id,
                    from,
                    to: SyncState::Synced,
                });
            }
        }

        sqlx::query(
            r#"
            UPDATE local_records
            SET sync_state = 'Synced',
                remote_id  = ?2,
                last_error = NULL,
                updated_at = ?3
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id.to_string())
        .bind(remote_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Pending → Failed, keeping the error for the UI.
    pub async fn mark_failed(&self, local_id: LocalId, error: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_state(&mut tx, local_id)
            .await?
            .ok_or(StoreError::NotFound(local_id))?;
        if !current.can_transition_to(SyncState::Failed) {
            return Err(StoreError::InvalidTransition {
                local_id,
                from: current,
                to: SyncState::Failed,
            });
        }

        sqlx::query(
            r#"
            UPDATE local_records
            SET sync_state = 'Failed',
                last_error = ?2,
                updated_at = ?3
            WHERE local_id = ?1
            "#,
        )
        .bind(local_id.to_string())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn fetch_state(
    tx: &mut Transaction<'_, Sqlite>,
    local_id: LocalId,
) -> Result<Option<SyncState>, StoreError> {
    let row = sqlx::query("SELECT sync_state FROM local_records WHERE local_id = ?1")
        .bind(local_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(row) => Ok(Some(parse_state(&row.try_get::<String, _>("sync_state")?)?)),
        None => Ok(None),
    }
}

fn check_synced_has_remote(
    local_id: LocalId,
    state: SyncState,
    remote_id: Option<&str>,
) -> Result<(), StoreError> {
    if state == SyncState::Synced && remote_id.is_none() {
        return Err(StoreError::Serialization(format!(
            "record {local_id} cannot be Synced without a remote id"
        )));
    }
    Ok(())
}

fn parse_state(s: &str) -> Result<SyncState, StoreError> {
    SyncState::parse(s).ok_or_else(|| StoreError::Serialization(format!("unknown sync_state '{s}'")))
}

fn encode_fields(fields: &Fields) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_fields(raw: &str) -> Result<Fields, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(format!("invalid fields JSON: {e}")))
}

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid {column}: {e}")))
}

/// Map a database row into a `LocalRecord`.
fn row_to_record(row: &SqliteRow) -> Result<LocalRecord, StoreError> {
    let local_id = row
        .try_get::<String, _>("local_id")?
        .parse::<LocalId>()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let entity_type = row
        .try_get::<String, _>("entity_type")?
        .parse::<EntityType>()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(LocalRecord {
        local_id,
        entity_type,
        fields: decode_fields(&row.try_get::<String, _>("fields")?)?,
        sync_state: parse_state(&row.try_get::<String, _>("sync_state")?)?,
        remote_id: row.try_get("remote_id")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
    })
}
