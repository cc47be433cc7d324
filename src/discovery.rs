//! Discovery: walk content-version roots, register file identity, assign
//! envelopes and enqueue the files that need work.
//!
//! Change detection is two-stage: size and mtime first, and only when
//! those moved is the file re-read and re-hashed. A file is enqueued when
//! it is new, its bytes changed, its envelope changed, or a forced rescan
//! was requested; files routed to the `skip` envelope are registered but
//! never enqueued.
//!
//! The routing table's hash is recorded in the store. When it differs from
//! the running table every content version is rescanned and every routed
//! file re-enqueued, so a routing change is never reinterpreted silently.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, ContentVersionConfig};
use crate::migrate::{self, META_ROUTING_HASH};
use crate::models::{priority, ContentVersion, FileRecord};
use crate::queue;
use crate::registry::{self, DEFINITIONS_STEP};
use crate::routing::{RoutingTable, SKIP_ENVELOPE};
use crate::signature::content_hash;

/// Per-content-version discovery counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub content_version: String,
    pub files: u64,
    pub added: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub removed: u64,
    pub skipped: u64,
    pub enqueued: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// True when a routing-table change forced a full rescan.
    pub routing_changed: bool,
    pub content_versions: Vec<ScanStats>,
    /// Queue items created (or raised) for discovered work.
    pub queue_ids: Vec<i64>,
}

/// Run discovery over one named content version, or all of them.
pub async fn discover(
    pool: &SqlitePool,
    config: &Config,
    routing: &RoutingTable,
    only: Option<&str>,
    force: bool,
) -> Result<DiscoveryReport> {
    if let Some(name) = only {
        if config.content_version(name).is_none() {
            bail!("unknown content version: '{}'", name);
        }
    }

    let routing_changed = sync_envelopes(pool, routing).await?;
    if routing_changed {
        info!(version = routing.version, "routing table changed; rescanning every content version");
    }

    let mut report = DiscoveryReport {
        routing_changed,
        ..Default::default()
    };

    for (layer, cv) in config.content_versions.iter().enumerate() {
        if !routing_changed && only.is_some_and(|name| name != cv.name) {
            continue;
        }
        let (stats, ids) = scan_content_version(
            pool,
            cv,
            layer as i64,
            routing,
            force || routing_changed,
        )
        .await?;
        report.content_versions.push(stats);
        report.queue_ids.extend(ids);
    }

    // Recorded only once every rescan it forces has been enqueued; an
    // interrupted pass leaves the old hash and is redone next time.
    migrate::set_meta(pool, META_ROUTING_HASH, &routing.hash).await?;
    Ok(report)
}

/// Write the envelope table and compare the routing hash with the stored
/// one. Returns `true` if a previously recorded hash differs.
async fn sync_envelopes(pool: &SqlitePool, routing: &RoutingTable) -> Result<bool> {
    let stored = migrate::get_meta(pool, META_ROUTING_HASH).await?;
    let changed = stored.as_deref().is_some_and(|h| h != routing.hash);

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM envelopes").execute(&mut *tx).await?;
    for (name, steps) in routing.envelopes() {
        sqlx::query("INSERT INTO envelopes (name, steps_json, routing_version) VALUES (?, ?, ?)")
            .bind(name)
            .bind(serde_json::to_string(steps)?)
            .bind(routing.version)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(changed)
}

/// Steps recorded for an envelope at discovery time.
pub async fn envelope_steps(pool: &SqlitePool, envelope: &str) -> Result<Option<Vec<String>>> {
    let json: Option<String> = sqlx::query_scalar("SELECT steps_json FROM envelopes WHERE name = ?")
        .bind(envelope)
        .fetch_optional(pool)
        .await?;
    match json {
        Some(j) => Ok(Some(serde_json::from_str(&j)?)),
        None => Ok(None),
    }
}

/// Insert or refresh a content-version row. Returns its id.
pub async fn ensure_content_version(
    pool: &SqlitePool,
    cv: &ContentVersionConfig,
    layer: i64,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO content_versions (name, root, writable, layer, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            root = excluded.root,
            writable = excluded.writable,
            layer = excluded.layer
        RETURNING id
        "#,
    )
    .bind(&cv.name)
    .bind(cv.root.display().to_string())
    .bind(cv.writable as i64)
    .bind(layer)
    .bind(chrono::Utc::now().timestamp())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn content_versions(pool: &SqlitePool) -> Result<Vec<ContentVersion>> {
    let rows = sqlx::query("SELECT id, name, root, writable, layer FROM content_versions ORDER BY layer")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(ContentVersion::from_row).collect())
}

pub async fn content_version_by_id(pool: &SqlitePool, id: i64) -> Result<Option<ContentVersion>> {
    let row = sqlx::query("SELECT id, name, root, writable, layer FROM content_versions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(ContentVersion::from_row))
}

/// One regular file found on disk.
struct Walked {
    relative_path: String,
    absolute: PathBuf,
    size: i64,
    mtime: i64,
}

struct Known {
    id: i64,
    content_hash: String,
    size: i64,
    mtime: i64,
    envelope: String,
    /// Neither a queue item nor a pointer has ever been recorded for it.
    untracked: bool,
}

/// A store write decided by a scan. A row write and the enqueue it implies
/// are committed together.
enum Change {
    Insert {
        relative_path: String,
        hash: String,
        size: i64,
        mtime: i64,
        envelope: String,
        enqueue: bool,
    },
    Update {
        id: i64,
        hash: String,
        size: i64,
        mtime: i64,
        envelope: String,
        enqueue: bool,
    },
    Enqueue(i64),
}

/// Changes applied per transaction.
const APPLY_BATCH: usize = 256;

async fn scan_content_version(
    pool: &SqlitePool,
    cv: &ContentVersionConfig,
    layer: i64,
    routing: &RoutingTable,
    force: bool,
) -> Result<(ScanStats, Vec<i64>)> {
    let cv_id = ensure_content_version(pool, cv, layer).await?;
    let mut stats = ScanStats {
        content_version: cv.name.clone(),
        ..Default::default()
    };

    let walk_cfg = cv.clone();
    let walked = tokio::task::spawn_blocking(move || walk(&walk_cfg))
        .await
        .context("discovery walk panicked")??;

    let rows = sqlx::query(
        r#"
        SELECT f.id, f.relative_path, f.content_hash, f.size, f.mtime, f.envelope,
               (NOT EXISTS (SELECT 1 FROM queue_items q WHERE q.file_id = f.id)
                AND NOT EXISTS (SELECT 1 FROM file_steps s WHERE s.file_id = f.id)) AS untracked
        FROM files f
        WHERE f.content_version_id = ?
        "#,
    )
    .bind(cv_id)
    .fetch_all(pool)
    .await?;
    let mut known: HashMap<String, Known> = rows
        .iter()
        .map(|r| {
            (
                r.get("relative_path"),
                Known {
                    id: r.get("id"),
                    content_hash: r.get("content_hash"),
                    size: r.get("size"),
                    mtime: r.get("mtime"),
                    envelope: r.get("envelope"),
                    untracked: r.get::<i64, _>("untracked") != 0,
                },
            )
        })
        .collect();

    let mut changes = Vec::new();

    for file in walked {
        stats.files += 1;
        let envelope = routing.envelope_for(&file.relative_path);
        let routed = envelope != SKIP_ENVELOPE;
        if !routed {
            stats.skipped += 1;
        }

        match known.remove(&file.relative_path) {
            None => {
                let hash = match hash_file(&file.absolute).await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(path = %file.relative_path, error = %e, "unreadable file skipped");
                        continue;
                    }
                };
                stats.added += 1;
                changes.push(Change::Insert {
                    relative_path: file.relative_path,
                    hash,
                    size: file.size,
                    mtime: file.mtime,
                    envelope: envelope.to_string(),
                    enqueue: routed,
                });
            }
            Some(prev) => {
                let stat_moved = prev.size != file.size || prev.mtime != file.mtime;
                let hash = if stat_moved {
                    match hash_file(&file.absolute).await {
                        Ok(h) => h,
                        Err(e) => {
                            warn!(path = %file.relative_path, error = %e, "unreadable file skipped");
                            continue;
                        }
                    }
                } else {
                    prev.content_hash.clone()
                };
                let bytes_changed = hash != prev.content_hash;
                let envelope_changed = envelope != prev.envelope;

                if bytes_changed || envelope_changed {
                    stats.changed += 1;
                } else {
                    stats.unchanged += 1;
                }
                let enqueue =
                    routed && (bytes_changed || envelope_changed || force || prev.untracked);

                if stat_moved || envelope_changed {
                    changes.push(Change::Update {
                        id: prev.id,
                        hash,
                        size: file.size,
                        mtime: file.mtime,
                        envelope: envelope.to_string(),
                        enqueue,
                    });
                } else if enqueue {
                    changes.push(Change::Enqueue(prev.id));
                }
            }
        }
    }

    // Whatever is still in `known` vanished from disk.
    for (path, gone) in known {
        remove_file(pool, gone.id).await?;
        debug!(content_version = %cv.name, path = %path, "file removed");
        stats.removed += 1;
    }

    let mut ids = Vec::new();
    for batch in changes.chunks(APPLY_BATCH) {
        ids.extend(apply_changes(pool, cv_id, batch).await?);
    }
    stats.enqueued = ids.len() as u64;

    info!(
        content_version = %cv.name,
        files = stats.files,
        added = stats.added,
        changed = stats.changed,
        removed = stats.removed,
        enqueued = stats.enqueued,
        "discovery finished"
    );

    Ok((stats, ids))
}

/// Apply one batch of scan changes in a single transaction. Returns the
/// queue ids of the files enqueued.
async fn apply_changes(pool: &SqlitePool, cv_id: i64, changes: &[Change]) -> Result<Vec<i64>> {
    let now = chrono::Utc::now().timestamp();
    let mut ids = Vec::new();
    let mut tx = pool.begin().await?;

    for change in changes {
        let (file_id, enqueue) = match change {
            Change::Insert {
                relative_path,
                hash,
                size,
                mtime,
                envelope,
                enqueue,
            } => {
                let id = sqlx::query(
                    r#"
                    INSERT INTO files (content_version_id, relative_path, content_hash, size, mtime, envelope, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(cv_id)
                .bind(relative_path.as_str())
                .bind(hash.as_str())
                .bind(*size)
                .bind(*mtime)
                .bind(envelope.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
                (id, *enqueue)
            }
            Change::Update {
                id,
                hash,
                size,
                mtime,
                envelope,
                enqueue,
            } => {
                sqlx::query(
                    r#"
                    UPDATE files
                    SET content_hash = ?, size = ?, mtime = ?, envelope = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(hash.as_str())
                .bind(*size)
                .bind(*mtime)
                .bind(envelope.as_str())
                .bind(now)
                .bind(*id)
                .execute(&mut *tx)
                .await?;
                (*id, *enqueue)
            }
            Change::Enqueue(id) => (*id, true),
        };
        if enqueue {
            ids.push(queue::enqueue_file_in(&mut *tx, file_id, priority::BULK).await?);
        }
    }

    tx.commit().await?;
    Ok(ids)
}

/// Delete a file row and its pointers; its open queue items are cancelled.
/// Dropping a definitions pointer advances the registry watermark.
async fn remove_file(pool: &SqlitePool, file_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE queue_items SET status = 'cancelled', lease_expires_at = NULL, updated_at = ?
        WHERE file_id = ? AND status IN ('pending', 'leased')
        "#,
    )
    .bind(queue::now_ms())
    .bind(file_id)
    .execute(&mut *tx)
    .await?;
    let definitions = sqlx::query("DELETE FROM file_steps WHERE file_id = ? AND step = ?")
        .bind(file_id)
        .bind(DEFINITIONS_STEP)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM file_steps WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
    if definitions > 0 {
        registry::bump_watermark(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

fn walk(cv: &ContentVersionConfig) -> Result<Vec<Walked>> {
    let root = &cv.root;
    if !root.is_dir() {
        bail!(
            "content version '{}' root does not exist: {}",
            cv.name,
            root.display()
        );
    }

    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(cv.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(cv.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative_path = relative_path(root, path);
        if exclude_set.is_match(&relative_path) {
            continue;
        }
        let (size, mtime) = stat(path)?;
        files.push(Walked {
            relative_path,
            absolute: path.to_path_buf(),
            size,
            mtime,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// Forward-slash path relative to the content-version root.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Size in bytes and modification time in Unix milliseconds.
fn stat(path: &Path) -> std::io::Result<(i64, i64)> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    Ok((metadata.len() as i64, mtime))
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(content_hash(&bytes))
}

pub async fn file(pool: &SqlitePool, file_id: i64) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM files WHERE id = ?")
        .bind(file_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(FileRecord::from_row))
}

pub async fn find_file(pool: &SqlitePool, content_version: &str, relative_path: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query(
        r#"
        SELECT f.* FROM files f
        JOIN content_versions cv ON cv.id = f.content_version_id
        WHERE cv.name = ? AND f.relative_path = ?
        "#,
    )
    .bind(content_version)
    .bind(relative_path)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(FileRecord::from_row))
}

/// Register one path named by a change notification, without walking the
/// rest of its root. Returns the file id (existing or new).
pub async fn register_path(
    pool: &SqlitePool,
    config: &Config,
    routing: &RoutingTable,
    content_version: &str,
    relative_path: &str,
) -> Result<i64> {
    let relative_path = relative_path.trim_start_matches("./").replace('\\', "/");
    if let Some(existing) = find_file(pool, content_version, &relative_path).await? {
        return Ok(existing.id);
    }

    let (layer, cv) = config
        .content_versions
        .iter()
        .enumerate()
        .find(|(_, cv)| cv.name == content_version)
        .ok_or_else(|| anyhow::anyhow!("unknown content version: '{}'", content_version))?;
    let absolute = cv.root.join(&relative_path);
    let (size, mtime) =
        stat(&absolute).with_context(|| format!("file not found: {}:{}", cv.name, relative_path))?;
    let hash = hash_file(&absolute).await?;
    let cv_id = ensure_content_version(pool, cv, layer as i64).await?;

    let id = sqlx::query(
        r#"
        INSERT INTO files (content_version_id, relative_path, content_hash, size, mtime, envelope, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(cv_id)
    .bind(&relative_path)
    .bind(&hash)
    .bind(size)
    .bind(mtime)
    .bind(routing.envelope_for(&relative_path))
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Result of re-checking a file right before it is processed.
#[derive(Debug)]
pub enum Refresh {
    /// Size and mtime match the stored row.
    Unchanged(FileRecord),
    /// The file moved on disk; the row now carries the new hash.
    Changed(FileRecord),
    /// The path no longer exists. The row stays until a rescan confirms it.
    Missing,
    /// The path exists but cannot be read as a file.
    Unreadable(String),
}

/// Re-stat a file and re-hash it if size or mtime moved. The envelope is
/// left alone: it is only ever assigned by discovery.
pub async fn refresh_file(pool: &SqlitePool, file: FileRecord, absolute: &Path) -> Result<Refresh> {
    let (size, mtime) = match stat(absolute) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Refresh::Missing),
        Err(e) => return Ok(Refresh::Unreadable(e.to_string())),
    };
    if size == file.size && mtime == file.mtime {
        return Ok(Refresh::Unchanged(file));
    }

    let hash = match hash_file(absolute).await {
        Ok(h) => h,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Refresh::Missing),
        Err(e) => return Ok(Refresh::Unreadable(e.to_string())),
    };
    sqlx::query("UPDATE files SET content_hash = ?, size = ?, mtime = ?, updated_at = ? WHERE id = ?")
        .bind(&hash)
        .bind(size)
        .bind(mtime)
        .bind(chrono::Utc::now().timestamp())
        .bind(file.id)
        .execute(pool)
        .await?;

    Ok(Refresh::Changed(FileRecord {
        content_hash: hash,
        size,
        mtime,
        ..file
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, DbConfig, RegistryConfig, RoutingConfig};
    use crate::migrate::memory_pool;
    use tempfile::TempDir;

    const ROUTES: &str = r#"
version = 1

[envelopes]
script = ["ingest", "parse", "extract-definitions"]

[[routes]]
pattern = "**/*.txt"
envelope = "script"
"#;

    fn config(root: &Path) -> Config {
        Config {
            db: DbConfig {
                path: root.join("store.sqlite"),
            },
            daemon: DaemonConfig::default(),
            routing: RoutingConfig {
                path: root.join("routes.toml"),
            },
            registry: RegistryConfig::default(),
            content_versions: vec![ContentVersionConfig {
                name: "base".into(),
                root: root.join("base"),
                writable: false,
                exclude_globs: vec![],
                follow_symlinks: false,
            }],
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join("base").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn registers_and_enqueues_routed_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "common/a.txt", "a = 1");
        write(tmp.path(), "common/b.txt", "b = 2");
        write(tmp.path(), "gfx/icon.dds", "binary");
        write(tmp.path(), ".git/HEAD", "ref");

        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        let routing = RoutingTable::parse(ROUTES).unwrap();

        let report = discover(&pool, &cfg, &routing, None, false).await.unwrap();
        let stats = &report.content_versions[0];
        assert_eq!(stats.files, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(report.queue_ids.len(), 2);

        // Second pass: nothing moved
        let report = discover(&pool, &cfg, &routing, None, false).await.unwrap();
        assert_eq!(report.content_versions[0].unchanged, 3);
        assert!(report.queue_ids.is_empty());

        assert_eq!(
            envelope_steps(&pool, "script").await.unwrap().unwrap(),
            vec!["ingest", "parse", "extract-definitions"]
        );
    }

    #[tokio::test]
    async fn change_and_removal_are_detected() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = 1");
        write(tmp.path(), "b.txt", "b = 2");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        let routing = RoutingTable::parse(ROUTES).unwrap();
        discover(&pool, &cfg, &routing, None, false).await.unwrap();

        write(tmp.path(), "a.txt", "a = 1000");
        std::fs::remove_file(tmp.path().join("base/b.txt")).unwrap();

        let report = discover(&pool, &cfg, &routing, None, false).await.unwrap();
        let stats = &report.content_versions[0];
        assert_eq!(stats.changed, 1);
        assert_eq!(stats.removed, 1);
        assert!(find_file(&pool, "base", "b.txt").await.unwrap().is_none());
        // a.txt's pending item from the first pass is reused
        assert_eq!(report.queue_ids.len(), 1);
    }

    #[tokio::test]
    async fn routing_change_forces_rescan() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = 1");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        discover(&pool, &cfg, &RoutingTable::parse(ROUTES).unwrap(), None, false)
            .await
            .unwrap();
        sqlx::query("UPDATE queue_items SET status = 'done'")
            .execute(&pool)
            .await
            .unwrap();

        let changed = RoutingTable::parse(&ROUTES.replace("version = 1", "version = 2")).unwrap();
        let report = discover(&pool, &cfg, &changed, None, false).await.unwrap();
        assert!(report.routing_changed);
        assert_eq!(report.queue_ids.len(), 1);
    }

    #[tokio::test]
    async fn refresh_rehashes_moved_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = 1");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        let routing = RoutingTable::parse(ROUTES).unwrap();
        discover(&pool, &cfg, &routing, None, false).await.unwrap();

        let record = find_file(&pool, "base", "a.txt").await.unwrap().unwrap();
        let path = tmp.path().join("base/a.txt");
        write(tmp.path(), "a.txt", "a = 2 # longer now");
        match refresh_file(&pool, record.clone(), &path).await.unwrap() {
            Refresh::Changed(f) => assert_ne!(f.content_hash, record.content_hash),
            other => panic!("expected change, got {:?}", other),
        }

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            refresh_file(&pool, record, &path).await.unwrap(),
            Refresh::Missing
        ));
    }

    #[tokio::test]
    async fn register_path_adds_a_single_file() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "events/new.txt", "e = 1");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        let routing = RoutingTable::parse(ROUTES).unwrap();

        let id = register_path(&pool, &cfg, &routing, "base", "events/new.txt")
            .await
            .unwrap();
        let again = register_path(&pool, &cfg, &routing, "base", "./events/new.txt")
            .await
            .unwrap();
        assert_eq!(id, again);
        assert!(register_path(&pool, &cfg, &routing, "base", "missing.txt").await.is_err());
        assert!(register_path(&pool, &cfg, &routing, "nope", "events/new.txt").await.is_err());
    }

    #[tokio::test]
    async fn file_left_without_work_is_requeued() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = 1");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        let routing = RoutingTable::parse(ROUTES).unwrap();
        discover(&pool, &cfg, &routing, None, false).await.unwrap();

        // A registered file with no queue item and no artifacts, as left by
        // an interrupted pass or a cleared queue
        sqlx::query("DELETE FROM queue_items").execute(&pool).await.unwrap();

        let report = discover(&pool, &cfg, &routing, None, false).await.unwrap();
        assert_eq!(report.content_versions[0].unchanged, 1);
        assert_eq!(report.queue_ids.len(), 1);

        // Once it has an item, an unchanged file is left alone
        sqlx::query("UPDATE queue_items SET status = 'failed'")
            .execute(&pool)
            .await
            .unwrap();
        let report = discover(&pool, &cfg, &routing, None, false).await.unwrap();
        assert!(report.queue_ids.is_empty());
    }

    #[tokio::test]
    async fn routing_hash_waits_for_the_rescan() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = 1");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        discover(&pool, &cfg, &RoutingTable::parse(ROUTES).unwrap(), None, false)
            .await
            .unwrap();
        sqlx::query("UPDATE queue_items SET status = 'done'")
            .execute(&pool)
            .await
            .unwrap();

        let changed = RoutingTable::parse(&ROUTES.replace("version = 1", "version = 2")).unwrap();
        let base = tmp.path().join("base");
        let moved = tmp.path().join("base.away");
        std::fs::rename(&base, &moved).unwrap();
        assert!(discover(&pool, &cfg, &changed, None, false).await.is_err());
        std::fs::rename(&moved, &base).unwrap();

        let report = discover(&pool, &cfg, &changed, None, false).await.unwrap();
        assert!(report.routing_changed);
        assert_eq!(report.queue_ids.len(), 1);

        let report = discover(&pool, &cfg, &changed, None, false).await.unwrap();
        assert!(!report.routing_changed);
    }

    #[tokio::test]
    async fn refresh_reports_unreadable_paths() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = 1");
        let pool = memory_pool().await;
        let cfg = config(tmp.path());
        let routing = RoutingTable::parse(ROUTES).unwrap();
        discover(&pool, &cfg, &routing, None, false).await.unwrap();

        let record = find_file(&pool, "base", "a.txt").await.unwrap().unwrap();
        let path = tmp.path().join("base/a.txt");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner.txt"), "padding so the size moves").unwrap();

        assert!(matches!(
            refresh_file(&pool, record, &path).await.unwrap(),
            Refresh::Unreadable(_)
        ));
    }
}
