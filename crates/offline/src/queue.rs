//! Offline-first mutation queue persisted in SQLite.
//!
//! Mutations are stored in the `pending_mutations` table and replayed in
//! global FIFO order (by an autoincrement sequence, across all entity types).
//! Removed ids are tombstoned in `retired_mutations` so an id is never
//! accepted twice, even after a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use erpsync_core::{EntityType, LocalId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::db::Database;
use crate::types::{MutationOperation, PendingMutation, QueueCorruption};

const SELECT_MUTATIONS: &str = r#"
    SELECT
        seq,
        id,
        entity_type,
        operation,
        remote_id,
        payload,
        created_at,
        attempt_count,
        last_error,
        last_attempt_at
    FROM pending_mutations
"#;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("pending mutation not found: {0}")]
    NotFound(LocalId),
    #[error("mutation id already used: {0}")]
    DuplicateMutation(LocalId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode mutation: {0}")]
    Serialization(String),
}

/// Why a mutation left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    /// The remote API confirmed the write.
    Applied,
    /// Given up: permanent failure, attempt ceiling, or operator discard.
    Abandoned,
}

impl RetireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireOutcome::Applied => "Applied",
            RetireOutcome::Abandoned => "Abandoned",
        }
    }
}

/// Result of reading the head of the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueBatch {
    /// Decodable mutations, oldest first.
    pub mutations: Vec<PendingMutation>,
    /// Rows skipped because they could not be decoded.
    pub corrupt: Vec<QueueCorruption>,
}

/// SQLite-backed pending mutation queue.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct PendingMutationQueue {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl PendingMutationQueue {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append a mutation. Existing entries are never reordered.
    pub async fn enqueue(&self, mutation: &PendingMutation) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let id = mutation.id.to_string();

        let (seen,): (i64,) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM pending_mutations WHERE id = ?1)
                 + (SELECT COUNT(*) FROM retired_mutations WHERE id = ?1)
            "#,
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;
        if seen > 0 {
            return Err(QueueError::DuplicateMutation(mutation.id));
        }

        let payload = serde_json::to_string(&mutation.payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pending_mutations (
                id,
                entity_type,
                operation,
                remote_id,
                payload,
                created_at,
                attempt_count,
                last_error,
                last_attempt_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&id)
        .bind(mutation.entity_type.as_str())
        .bind(mutation.operation.as_str())
        .bind(mutation.remote_id.as_deref())
        .bind(payload)
        .bind(mutation.created_at.to_rfc3339())
        .bind(mutation.attempt_count as i64)
        .bind(mutation.last_error.as_deref())
        .bind(mutation.last_attempt_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(
            mutation_id = %mutation.id,
            entity = %mutation.entity_type,
            operation = mutation.operation.as_str(),
            "enqueued mutation"
        );
        Ok(())
    }

    /// Up to `max_n` mutations, oldest first.
    ///
    /// Rows that fail to decode are skipped (and logged) instead of failing
    /// the whole batch; one bad entry must not block the rest of the queue.
    /// Skipped rows do not count towards `max_n`.
    pub async fn peek_batch(&self, max_n: usize) -> Result<QueueBatch, QueueError> {
        let mut batch = QueueBatch::default();
        let mut after_seq = 0i64;

        loop {
            let wanted = max_n.saturating_sub(batch.mutations.len());
            if wanted == 0 {
                break;
            }
            let rows = sqlx::query(&format!("{SELECT_MUTATIONS} WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"))
                .bind(after_seq)
                .bind(i64::try_from(wanted).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await?;

            let fetched = rows.len();
            for row in rows {
                after_seq = row.try_get("seq")?;
                match row_to_mutation(&row) {
                    Ok(mutation) => batch.mutations.push(mutation),
                    Err(reason) => {
                        let raw_id: String = row.try_get("id").unwrap_or_default();
                        tracing::error!(seq = after_seq, raw_id = %raw_id, reason = %reason, "skipping corrupt queue entry");
                        batch.corrupt.push(QueueCorruption {
                            seq: after_seq,
                            raw_id,
                            reason,
                        });
                    }
                }
            }
            if fetched < wanted {
                break;
            }
        }
        Ok(batch)
    }

    /// Every queued mutation, oldest first.
    pub async fn list_all(&self) -> Result<QueueBatch, QueueError> {
        self.peek_batch(usize::MAX).await
    }

    /// The queued mutation with `id`; `None` if absent or undecodable.
    pub async fn get(&self, id: LocalId) -> Result<Option<PendingMutation>, QueueError> {
        let row = sqlx::query(&format!("{SELECT_MUTATIONS} WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| match row_to_mutation(&row) {
            Ok(mutation) => Some(mutation),
            Err(reason) => {
                tracing::error!(mutation_id = %id, reason = %reason, "queued mutation is unreadable");
                None
            }
        }))
    }

    /// Number of rows in the queue (including undecodable ones).
    pub async fn len(&self) -> Result<usize, QueueError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_mutations")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Whether `id` is queued now or was ever retired.
    pub async fn contains_ever(&self, id: LocalId) -> Result<bool, QueueError> {
        let (seen,): (i64,) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM pending_mutations WHERE id = ?1)
                 + (SELECT COUNT(*) FROM retired_mutations WHERE id = ?1)
            "#,
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(seen > 0)
    }

    /// Record a replay attempt; returns the new attempt count.
    pub async fn mark_attempt(&self, id: LocalId, error: Option<&str>) -> Result<u32, QueueError> {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query(
            r#"
            UPDATE pending_mutations
            SET attempt_count   = attempt_count + 1,
                last_error      = ?2,
                last_attempt_at = ?3
            WHERE id = ?1
            RETURNING attempt_count
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotFound(id))?;

        let attempts: i64 = row.try_get("attempt_count")?;
        Ok(attempts.max(0) as u32)
    }

    /// Remove a mutation and tombstone its id.
    pub async fn remove(&self, id: LocalId, outcome: RetireOutcome) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM pending_mutations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(QueueError::NotFound(id));
        }

        retire(&mut tx, &id.to_string(), outcome).await?;
        tx.commit().await?;
        tracing::debug!(mutation_id = %id, outcome = outcome.as_str(), "removed mutation");
        Ok(())
    }

    /// Drop an undecodable row reported by [`peek_batch`](Self::peek_batch).
    pub async fn drop_corrupt(&self, entry: &QueueCorruption) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pending_mutations WHERE seq = ?1")
            .bind(entry.seq)
            .execute(&mut *tx)
            .await?;
        if !entry.raw_id.is_empty() {
            retire(&mut tx, &entry.raw_id, RetireOutcome::Abandoned).await?;
        }

        tx.commit().await?;
        tracing::warn!(seq = entry.seq, raw_id = %entry.raw_id, "dropped corrupt queue entry");
        Ok(())
    }
}

async fn retire(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    raw_id: &str,
    outcome: RetireOutcome,
) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO retired_mutations (id, outcome, retired_at)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(raw_id)
    .bind(outcome.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid {column}: {e}"))
}

/// Map a database row into a `PendingMutation`.
fn row_to_mutation(row: &SqliteRow) -> Result<PendingMutation, String> {
    let get = |column: &str| -> Result<String, String> {
        row.try_get::<String, _>(column)
            .map_err(|e| format!("unreadable {column}: {e}"))
    };
    let get_opt = |column: &str| -> Result<Option<String>, String> {
        row.try_get::<Option<String>, _>(column)
            .map_err(|e| format!("unreadable {column}: {e}"))
    };

    let id = get("id")?.parse::<LocalId>().map_err(|e| e.to_string())?;
    let entity_type = get("entity_type")?
        .parse::<EntityType>()
        .map_err(|e| e.to_string())?;
    let operation_str = get("operation")?;
    let operation = MutationOperation::parse(&operation_str)
        .ok_or_else(|| format!("unknown operation '{operation_str}'"))?;
    let remote_id = get_opt("remote_id")?;
    if operation == MutationOperation::Update && remote_id.is_none() {
        return Err("update mutation without remote_id".to_string());
    }

    let payload = serde_json::from_str(&get("payload")?)
        .map_err(|e| format!("invalid JSON payload: {e}"))?;

    let attempt_count: i64 = row
        .try_get("attempt_count")
        .map_err(|e| format!("unreadable attempt_count: {e}"))?;

    let last_attempt_at = match get_opt("last_attempt_at")? {
        Some(s) => Some(parse_time(&s, "last_attempt_at")?),
        None => None,
    };

    Ok(PendingMutation {
        id,
        entity_type,
        operation,
        remote_id,
        payload,
        created_at: parse_time(&get("created_at")?, "created_at")?,
        attempt_count: attempt_count.max(0) as u32,
        last_error: get_opt("last_error")?,
        last_attempt_at,
    })
}
