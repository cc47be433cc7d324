//! Store schema, metadata keys and resets.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::error::DaemonError;

/// Bumped whenever the table layout below changes incompatibly.
pub const SCHEMA_VERSION: i64 = 1;

pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_TOOL_VERSIONS: &str = "tool_versions";
pub const META_ROUTING_HASH: &str = "routing_hash";
pub const META_WATERMARK: &str = "registry_watermark";

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS content_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        root TEXT NOT NULL,
        writable INTEGER NOT NULL DEFAULT 0,
        layer INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS envelopes (
        name TEXT PRIMARY KEY,
        steps_json TEXT NOT NULL,
        routing_version INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_version_id INTEGER NOT NULL,
        relative_path TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size INTEGER NOT NULL,
        mtime INTEGER NOT NULL,
        envelope TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(content_version_id, relative_path),
        FOREIGN KEY (content_version_id) REFERENCES content_versions(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        file_id INTEGER,
        content_version_id INTEGER,
        priority INTEGER NOT NULL,
        sequence INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        lease_owner TEXT,
        lease_expires_at INTEGER,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        not_before INTEGER,
        outcome TEXT,
        last_error_kind TEXT,
        last_error TEXT,
        session_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE SET NULL,
        FOREIGN KEY (content_version_id) REFERENCES content_versions(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts (
        signature TEXT PRIMARY KEY,
        step TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        tool_version TEXT NOT NULL,
        upstream_signature TEXT,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifact_definitions (
        artifact_signature TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER NOT NULL,
        FOREIGN KEY (artifact_signature) REFERENCES artifacts(signature) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifact_references (
        artifact_signature TEXT NOT NULL,
        name TEXT NOT NULL,
        context TEXT NOT NULL,
        line INTEGER NOT NULL,
        FOREIGN KEY (artifact_signature) REFERENCES artifacts(signature) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_steps (
        file_id INTEGER NOT NULL,
        step TEXT NOT NULL,
        signature TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (file_id, step),
        FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS step_failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_item_id INTEGER NOT NULL,
        file_id INTEGER,
        step TEXT NOT NULL,
        error_kind TEXT NOT NULL,
        message TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (queue_item_id) REFERENCES queue_items(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS registry_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        watermark INTEGER NOT NULL,
        definition_count INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS registry_entries (
        snapshot_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        content_version TEXT NOT NULL,
        layer INTEGER NOT NULL,
        relative_path TEXT NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER NOT NULL,
        FOREIGN KEY (snapshot_id) REFERENCES registry_snapshots(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        mode TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        built INTEGER NOT NULL DEFAULT 0,
        reused INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_queue_claim ON queue_items(status, priority DESC, sequence ASC)",
    "CREATE INDEX IF NOT EXISTS idx_queue_file ON queue_items(file_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_files_hash ON files(content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_hash ON artifacts(content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_definitions_artifact ON artifact_definitions(artifact_signature)",
    "CREATE INDEX IF NOT EXISTS idx_references_artifact ON artifact_references(artifact_signature)",
    "CREATE INDEX IF NOT EXISTS idx_registry_name ON registry_entries(snapshot_id, name)",
];

/// Create every table and index, then check the recorded schema version.
///
/// A fresh store is stamped with [`SCHEMA_VERSION`]; a store stamped with
/// anything else is refused rather than silently reused.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }

    match get_meta(pool, META_SCHEMA_VERSION).await? {
        None => set_meta(pool, META_SCHEMA_VERSION, &SCHEMA_VERSION.to_string()).await?,
        Some(found) => check_stamp(Some(found))?,
    }

    Ok(())
}

/// Check the recorded schema version without creating or stamping
/// anything. Used by readers that do not hold the writer lock.
pub async fn check_schema(pool: &SqlitePool) -> Result<()> {
    check_stamp(get_meta(pool, META_SCHEMA_VERSION).await?)
}

fn check_stamp(found: Option<String>) -> Result<()> {
    let found: i64 = found.and_then(|v| v.parse().ok()).unwrap_or(-1);
    if found != SCHEMA_VERSION {
        return Err(DaemonError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            found,
        }
        .into());
    }
    Ok(())
}

pub async fn get_meta(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn set_meta(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meta (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clear queue state only (`strata reset`).
pub async fn reset_queue(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM queue_items").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Truncate everything (`strata reset --fresh`): content versions, files,
/// queue, artifacts, registry snapshots and metadata other than the schema
/// stamp. Discovery must be able to repopulate from this state.
pub async fn reset_fresh(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in [
        "registry_entries",
        "registry_snapshots",
        "step_failures",
        "queue_items",
        "file_steps",
        "artifact_references",
        "artifact_definitions",
        "artifacts",
        "files",
        "envelopes",
        "content_versions",
        "runs",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM meta WHERE key != ?")
        .bind(META_SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
