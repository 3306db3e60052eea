//! SQLite database shared by the local record store and the mutation queue.
//!
//! Both collections live in one physical file:
//! `{app_data_dir}/erpsync/offline.db`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS local_records (
        seq          INTEGER PRIMARY KEY AUTOINCREMENT,
        local_id     TEXT NOT NULL UNIQUE,
        entity_type  TEXT NOT NULL,
        fields       TEXT NOT NULL,
        sync_state   TEXT NOT NULL,
        remote_id    TEXT NULL,
        last_error   TEXT NULL,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_local_records_entity
        ON local_records (entity_type, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pending_mutations (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT NOT NULL UNIQUE,
        entity_type      TEXT NOT NULL,
        operation        TEXT NOT NULL,
        remote_id        TEXT NULL,
        payload          TEXT NOT NULL,
        created_at       TEXT NOT NULL,
        attempt_count    INTEGER NOT NULL DEFAULT 0,
        last_error       TEXT NULL,
        last_attempt_at  TEXT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retired_mutations (
        id          TEXT PRIMARY KEY,
        outcome     TEXT NOT NULL,
        retired_at  TEXT NOT NULL
    )
    "#,
];

/// Handle to the offline database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file at `path` and apply the schema.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create offline DB directory at {:?}", parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to create SQLite pool for offline DB at {:?}", path))?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!(path = %path.display(), "offline database ready");
        Ok(db)
    }

    /// Open the database at the default per-user location.
    pub async fn open_default() -> anyhow::Result<Self> {
        let path = default_db_path()
            .context("failed to determine offline DB path - ensure app data directory is accessible")?;
        Self::open(&path).await
    }

    /// Non-durable database for tests and previews.
    ///
    /// Pinned to a single connection that never expires; every new
    /// connection to `:memory:` would otherwise see an empty database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory SQLite URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to create in-memory SQLite pool")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections (flushes the WAL on the last one).
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply offline DB schema")?;
        }
        Ok(())
    }
}

/// Resolve the default path of the offline database.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut path = base;
    path.push("erpsync");
    path.push("offline.db");
    Ok(path)
}
