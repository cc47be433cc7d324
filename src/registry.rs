//! Cross-file registry.
//!
//! Extraction only ever emits file-local definitions. This module
//! aggregates the current ones (through `file_steps` pointers to
//! `extract-definitions` artifacts) into immutable, numbered snapshots and
//! answers "where is X defined" against exactly one snapshot.
//!
//! The watermark in `meta` counts definition-pointer changes. A snapshot
//! records the watermark it was built at; once the live watermark has
//! moved `rebuild_threshold` past the latest snapshot a new one is built.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::migrate::META_WATERMARK;
use crate::models::Location;

/// Step whose artifacts feed the registry.
pub const DEFINITIONS_STEP: &str = "extract-definitions";
const REFERENCES_STEP: &str = "extract-references";

/// Snapshots kept by garbage collection.
pub const KEEP_SNAPSHOTS: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub id: i64,
    pub watermark: i64,
    pub definition_count: i64,
    pub created_at: i64,
}

impl Snapshot {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            watermark: row.get("watermark"),
            definition_count: row.get("definition_count"),
            created_at: row.get("created_at"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub name: String,
    pub snapshot_id: i64,
    pub watermark: i64,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub name: String,
    pub context: String,
    pub line: i64,
    pub locations: Vec<Location>,
}

pub async fn watermark(pool: &SqlitePool) -> Result<i64> {
    let mut conn = pool.acquire().await?;
    read_watermark(&mut *conn).await
}

async fn read_watermark(conn: &mut SqliteConnection) -> Result<i64> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(META_WATERMARK)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
}

/// Advance the watermark by one inside the caller's transaction.
pub(crate) async fn bump_watermark(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meta (key, value) VALUES (?, '1')
        ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
        "#,
    )
    .bind(META_WATERMARK)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Build a new snapshot from every current definitions pointer.
pub async fn build_snapshot(pool: &SqlitePool) -> Result<Snapshot> {
    let mut tx = pool.begin().await?;
    let now = chrono::Utc::now().timestamp();

    // Write first so the transaction owns the write lock before reading.
    let id = sqlx::query(
        "INSERT INTO registry_snapshots (watermark, definition_count, created_at) VALUES (0, 0, ?)",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let watermark = read_watermark(&mut *tx).await?;

    let count = sqlx::query(
        r#"
        INSERT INTO registry_entries (snapshot_id, name, content_version, layer, relative_path, kind, line)
        SELECT ?, d.name, cv.name, cv.layer, f.relative_path, d.kind, d.line
        FROM file_steps fs
        JOIN files f ON f.id = fs.file_id
        JOIN content_versions cv ON cv.id = f.content_version_id
        JOIN artifact_definitions d ON d.artifact_signature = fs.signature
        WHERE fs.step = ?
        "#,
    )
    .bind(id)
    .bind(DEFINITIONS_STEP)
    .execute(&mut *tx)
    .await?
    .rows_affected() as i64;

    sqlx::query("UPDATE registry_snapshots SET watermark = ?, definition_count = ? WHERE id = ?")
        .bind(watermark)
        .bind(count)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(snapshot = id, watermark, definitions = count, "registry snapshot built");
    Ok(Snapshot {
        id,
        watermark,
        definition_count: count,
        created_at: now,
    })
}

/// Rebuild if the watermark has advanced at least `threshold` past the
/// latest snapshot.
pub async fn maybe_rebuild(pool: &SqlitePool, threshold: i64) -> Result<Option<Snapshot>> {
    let current = watermark(pool).await?;
    let built_at = latest(pool).await?.map(|s| s.watermark).unwrap_or(0);
    if current > built_at && current - built_at >= threshold {
        return Ok(Some(build_snapshot(pool).await?));
    }
    Ok(None)
}

pub async fn latest(pool: &SqlitePool) -> Result<Option<Snapshot>> {
    let row = sqlx::query("SELECT * FROM registry_snapshots ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(Snapshot::from_row))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Snapshot>> {
    let row = sqlx::query("SELECT * FROM registry_snapshots WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(Snapshot::from_row))
}

async fn pick(pool: &SqlitePool, snapshot_id: Option<i64>) -> Result<Snapshot> {
    let snapshot = match snapshot_id {
        Some(id) => get(pool, id).await?,
        None => latest(pool).await?,
    };
    match (snapshot, snapshot_id) {
        (Some(s), _) => Ok(s),
        (None, Some(id)) => bail!("registry snapshot {} not found", id),
        (None, None) => bail!("no registry snapshot has been built yet; run `strata snapshot`"),
    }
}

async fn locations(pool: &SqlitePool, snapshot_id: i64, name: &str) -> Result<Vec<Location>> {
    let rows = sqlx::query(
        r#"
        SELECT content_version, layer, relative_path, kind, line
        FROM registry_entries
        WHERE snapshot_id = ? AND name = ?
        ORDER BY layer, relative_path, line
        "#,
    )
    .bind(snapshot_id)
    .bind(name)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| Location {
            content_version: r.get("content_version"),
            layer: r.get("layer"),
            relative_path: r.get("relative_path"),
            kind: r.get("kind"),
            line: r.get("line"),
        })
        .collect())
}

/// Every defining location of `name` in one snapshot (latest by default).
/// Locations are listed base layer first; deciding which one wins is left
/// to the caller.
pub async fn resolve(pool: &SqlitePool, name: &str, snapshot_id: Option<i64>) -> Result<Resolution> {
    let snapshot = pick(pool, snapshot_id).await?;
    Ok(Resolution {
        name: name.to_string(),
        snapshot_id: snapshot.id,
        watermark: snapshot.watermark,
        locations: locations(pool, snapshot.id, name).await?,
    })
}

/// Resolve every reference of one file against one snapshot.
pub async fn resolve_file(
    pool: &SqlitePool,
    file_id: i64,
    snapshot_id: Option<i64>,
) -> Result<Vec<ResolvedReference>> {
    let snapshot = pick(pool, snapshot_id).await?;
    let rows = sqlx::query(
        r#"
        SELECT r.name, r.context, r.line
        FROM file_steps fs
        JOIN artifact_references r ON r.artifact_signature = fs.signature
        WHERE fs.file_id = ? AND fs.step = ?
        ORDER BY r.line, r.name
        "#,
    )
    .bind(file_id)
    .bind(REFERENCES_STEP)
    .fetch_all(pool)
    .await?;

    let mut resolved = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get("name");
        let locations = locations(pool, snapshot.id, &name).await?;
        resolved.push(ResolvedReference {
            name,
            context: row.get("context"),
            line: row.get("line"),
            locations,
        });
    }
    Ok(resolved)
}

/// Delete all but the newest `keep` snapshots.
pub async fn prune(pool: &SqlitePool, keep: i64) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let stale = "SELECT id FROM registry_snapshots ORDER BY id DESC LIMIT -1 OFFSET ?";
    sqlx::query(&format!(
        "DELETE FROM registry_entries WHERE snapshot_id IN ({})",
        stale
    ))
    .bind(keep)
    .execute(&mut *tx)
    .await?;
    let deleted = sqlx::query(&format!("DELETE FROM registry_snapshots WHERE id IN ({})", stale))
        .bind(keep)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(deleted)
}
