//! CLI commands other than `start`, `build`, `status` and `health`.
//!
//! Commands that mutate state go through a running daemon when there is
//! one. Without a daemon, `discover`, `snapshot`, `gc` and `reset` take the
//! writer lock themselves; `enqueue`, `wait`, `cancel` and `stop` need a
//! daemon and say so.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::artifacts;
use crate::client::ControlClient;
use crate::config::Config;
use crate::daemon::{self, StartOptions, Store};
use crate::db;
use crate::discovery::{self, DiscoveryReport};
use crate::error::DaemonError;
use crate::lock::WriterLock;
use crate::migrate;
use crate::protocol::{EnqueueScanRequest, FileRef};
use crate::queue::ItemStatus;
use crate::registry::{self, Resolution, ResolvedReference, KEEP_SNAPSHOTS};
use crate::steps::StepRegistry;

async fn require_daemon(config: &Config, name: &str) -> Result<ControlClient> {
    match ControlClient::connect_running(config, name).await {
        Some(c) => Ok(c),
        None => bail!(
            "no daemon is running for {}; start one with `strata start`",
            config.db.path.display()
        ),
    }
}

/// Writer lock plus an opened store, for commands run without a daemon.
struct Offline {
    lock: WriterLock,
    store: Store,
}

impl Offline {
    async fn open(config: &Config) -> Result<Self> {
        let run_id = daemon::run_id();
        let lock = WriterLock::acquire(&config.lock_path(), &config.db.path, &run_id)?;
        let store =
            daemon::open_store(config, &StepRegistry::with_builtins(), StartOptions::default()).await?;
        Ok(Self { lock, store })
    }

    async fn close(self) {
        self.store.pool.close().await;
        self.lock.release();
    }
}

// ============ discover ============

pub async fn run_discover(config: &Config, content_version: Option<&str>, force: bool) -> Result<()> {
    if let Some(name) = content_version {
        if config.content_version(name).is_none() {
            bail!("unknown content version: '{}'", name);
        }
    }

    let report = match ControlClient::connect_running(config, "cli:discover").await {
        Some(client) => {
            let req = EnqueueScanRequest {
                content_versions: content_version.map(|n| vec![n.to_string()]).unwrap_or_default(),
                force,
                defer: false,
            };
            let resp = client.enqueue_scan(&req).await?;
            resp.report.unwrap_or(DiscoveryReport {
                queue_ids: resp.queue_ids,
                ..Default::default()
            })
        }
        None => {
            let offline = Offline::open(config).await?;
            let report = discovery::discover(
                &offline.store.pool,
                config,
                &offline.store.routing,
                content_version,
                force,
            )
            .await;
            offline.close().await;
            report?
        }
    };

    print_discovery(&report);
    Ok(())
}

fn print_discovery(report: &DiscoveryReport) {
    if report.routing_changed {
        println!("Routing table changed; every content version was rescanned.");
    }
    println!(
        "  {:<16} {:>7} {:>7} {:>8} {:>10} {:>8} {:>8} {:>9}",
        "CONTENT VERSION", "FILES", "ADDED", "CHANGED", "UNCHANGED", "REMOVED", "SKIPPED", "ENQUEUED"
    );
    println!("  {}", "-".repeat(84));
    for s in &report.content_versions {
        println!(
            "  {:<16} {:>7} {:>7} {:>8} {:>10} {:>8} {:>8} {:>9}",
            s.content_version, s.files, s.added, s.changed, s.unchanged, s.removed, s.skipped, s.enqueued
        );
    }
    println!();
    println!("{} queue item(s) enqueued.", report.queue_ids.len());
}

// ============ enqueue / wait / cancel / stop ============

pub async fn run_enqueue(config: &Config, specs: &[String], priority: i64) -> Result<()> {
    let mut files = Vec::with_capacity(specs.len());
    for spec in specs {
        let f = FileRef::parse(spec)
            .with_context(|| format!("expected <content_version>:<path>, got '{}'", spec))?;
        files.push(f);
    }

    let client = require_daemon(config, "cli:enqueue").await?;
    let ids = client.enqueue_files(files, priority).await?;
    println!("{}", join_ids(&ids));
    Ok(())
}

pub async fn run_wait(config: &Config, ids: &[i64], timeout: Duration) -> Result<()> {
    let client = require_daemon(config, "cli:wait").await?;
    let resp = client.wait(ids.to_vec(), timeout).await?;

    print_items(&resp.items);
    let s = &resp.summary;
    println!();
    println!(
        "built {}  reused {}  failed {}  cancelled {}  pending {}  leased {}",
        s.built, s.reused, s.failed, s.cancelled, s.pending, s.leased
    );
    if !s.idle {
        bail!("timed out with {} item(s) still open", s.pending + s.leased);
    }
    if s.failed > 0 {
        bail!("{} item(s) failed", s.failed);
    }
    Ok(())
}

fn print_items(items: &[ItemStatus]) {
    println!("  {:<8} {:<10} {:<8} {:>8}   {}", "ID", "STATUS", "OUTCOME", "ATTEMPTS", "LAST ERROR");
    for i in items {
        println!(
            "  {:<8} {:<10} {:<8} {:>8}   {}",
            i.queue_id,
            i.status.as_str(),
            i.outcome.as_deref().unwrap_or("-"),
            i.attempt_count,
            i.last_error.as_deref().unwrap_or("")
        );
    }
}

pub async fn run_cancel(config: &Config, ids: &[i64]) -> Result<()> {
    let client = require_daemon(config, "cli:cancel").await?;
    let cancelled = client.cancel(ids.to_vec()).await?;
    println!("Cancelled {} of {} item(s).", cancelled, ids.len());
    Ok(())
}

pub async fn run_stop(config: &Config) -> Result<()> {
    let client = require_daemon(config, "cli:stop").await?;
    client.shutdown().await?;
    println!("Daemon is draining and will exit.");
    Ok(())
}

// ============ registry ============

pub async fn run_snapshot(config: &Config) -> Result<()> {
    let snapshot = match ControlClient::connect_running(config, "cli:snapshot").await {
        Some(client) => client.snapshot().await?,
        None => {
            let offline = Offline::open(config).await?;
            let snapshot = registry::build_snapshot(&offline.store.pool).await;
            offline.close().await;
            snapshot?
        }
    };
    println!(
        "Snapshot {}: {} definitions at watermark {}.",
        snapshot.id, snapshot.definition_count, snapshot.watermark
    );
    Ok(())
}

pub async fn run_resolve(config: &Config, name: &str, snapshot_id: Option<i64>) -> Result<()> {
    let resolution = match ControlClient::connect_running(config, "cli:resolve").await {
        Some(client) => client.resolve(name, snapshot_id).await?,
        None => {
            let pool = open_readonly(config).await?;
            let res = registry::resolve(&pool, name, snapshot_id).await;
            pool.close().await;
            res?
        }
    };
    print_resolution(&resolution);
    Ok(())
}

fn print_resolution(res: &Resolution) {
    println!(
        "{} (snapshot {}, watermark {})",
        res.name, res.snapshot_id, res.watermark
    );
    if res.locations.is_empty() {
        println!("  not defined");
    }
    for loc in &res.locations {
        println!(
            "  [{}] {}:{}:{}  {}",
            loc.layer, loc.content_version, loc.relative_path, loc.line, loc.kind
        );
    }
}

pub async fn run_resolve_file(config: &Config, spec: &str, snapshot_id: Option<i64>) -> Result<()> {
    let file = FileRef::parse(spec)
        .with_context(|| format!("expected <content_version>:<path>, got '{}'", spec))?;

    let resolved = match ControlClient::connect_running(config, "cli:resolve").await {
        Some(client) => client.resolve_file(file, snapshot_id).await?,
        None => {
            let pool = open_readonly(config).await?;
            let res = async {
                let record = discovery::find_file(&pool, &file.content_version, &file.path)
                    .await?
                    .with_context(|| format!("file not found: {}", spec))?;
                registry::resolve_file(&pool, record.id, snapshot_id).await
            }
            .await;
            pool.close().await;
            res?
        }
    };
    print_references(&resolved);
    Ok(())
}

fn print_references(refs: &[ResolvedReference]) {
    for r in refs {
        let target = match r.locations.last() {
            Some(loc) => format!("{}:{}:{}", loc.content_version, loc.relative_path, loc.line),
            None => "unresolved".to_string(),
        };
        println!("  {:>5}  {:<24} {:<20} -> {}", r.line, r.name, r.context, target);
    }
}

async fn open_readonly(config: &Config) -> Result<sqlx::SqlitePool> {
    let pool = db::connect_readonly(config).await?;
    if let Err(e) = migrate::check_schema(&pool).await {
        pool.close().await;
        return Err(e);
    }
    Ok(pool)
}

// ============ gc ============

pub async fn run_gc(config: &Config) -> Result<()> {
    let (artifacts_deleted, snapshots_pruned) =
        match ControlClient::connect_running(config, "cli:gc").await {
            Some(client) => {
                let r = client.gc().await?;
                (r.artifacts_deleted, r.snapshots_pruned)
            }
            None => {
                let offline = Offline::open(config).await?;
                let res = async {
                    let a = artifacts::gc(&offline.store.pool).await?;
                    let s = registry::prune(&offline.store.pool, KEEP_SNAPSHOTS).await?;
                    anyhow::Ok((a, s))
                }
                .await;
                offline.close().await;
                res?
            }
        };
    println!(
        "Deleted {} artifact(s) and {} registry snapshot(s).",
        artifacts_deleted, snapshots_pruned
    );
    Ok(())
}

// ============ reset ============

/// Clear the queue, or with `fresh` truncate the whole store. Refused while
/// another process holds the writer lock.
pub async fn run_reset(config: &Config, fresh: bool) -> Result<()> {
    let lock = WriterLock::acquire(&config.lock_path(), &config.db.path, &daemon::run_id())?;
    let pool = db::connect(config).await?;

    match migrate::run_migrations(&pool).await {
        Ok(()) if fresh => {
            migrate::reset_fresh(&pool).await?;
            pool.close().await;
            println!("Store truncated; run `strata discover` or `strata build` to repopulate.");
        }
        Ok(()) => {
            let n = migrate::reset_queue(&pool).await?;
            pool.close().await;
            println!("Cleared {} queue item(s).", n);
        }
        Err(e) if fresh && matches!(e.downcast_ref::<DaemonError>(), Some(DaemonError::SchemaMismatch { .. })) => {
            warn!(error = %e, "schema mismatch; recreating the store");
            pool.close().await;
            remove_store_files(&config.db.path)?;
            let pool = db::connect(config).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Store recreated at the current schema version.");
        }
        Err(e) => {
            pool.close().await;
            return Err(e);
        }
    }

    lock.release();
    Ok(())
}

fn remove_store_files(db_path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut p = db_path.as_os_str().to_os_string();
        p.push(suffix);
        let p = std::path::PathBuf::from(p);
        if p.exists() {
            std::fs::remove_file(&p).with_context(|| format!("failed to remove {}", p.display()))?;
        }
    }
    Ok(())
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" ")
}
