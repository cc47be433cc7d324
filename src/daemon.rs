//! Daemon lifecycle: take the writer lock, open the store, start workers
//! and the control plane, then drain on shutdown.
//!
//! The writer lock is always taken before the store is opened, so a
//! refused second writer never touches the database.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::discovery;
use crate::error::DaemonError;
use crate::lock::WriterLock;
use crate::migrate::{self, META_TOOL_VERSIONS};
use crate::models::priority;
use crate::queue::{self, Summary};
use crate::routing::{RoutingTable, SKIP_ENVELOPE};
use crate::server;
use crate::steps::StepRegistry;
use crate::worker::Engine;

/// Environment variable carrying a run id into a detached child.
pub const RUN_ID_ENV: &str = "STRATA_RUN_ID";

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Truncate the store before starting.
    pub fresh: bool,
    /// Record the running step versions instead of refusing on mismatch.
    pub accept_tool_versions: bool,
}

/// An opened store owned by the current writer.
pub struct Store {
    pub pool: SqlitePool,
    pub routing: Arc<RoutingTable>,
}

/// Run the daemon with the built-in steps until shutdown.
pub async fn run_daemon(config: &Config, opts: StartOptions) -> Result<()> {
    run_daemon_with_steps(config, StepRegistry::with_builtins(), opts).await
}

/// Run the daemon with a caller-supplied step set.
///
/// Custom binaries register extra steps (or replace built-ins by name) on a
/// [`StepRegistry`] and pass it here; routing envelopes may then name them.
pub async fn run_daemon_with_steps(
    config: &Config,
    steps: StepRegistry,
    opts: StartOptions,
) -> Result<()> {
    let run_id = run_id();
    let mut lock = WriterLock::acquire(&config.lock_path(), &config.db.path, &run_id)?;
    info!(run_id = %run_id, store = %config.db.path.display(), "writer lock acquired");

    let store = open_store(config, &steps, opts).await?;
    start_run(&store.pool, &run_id, "daemon").await?;

    let workers = config.daemon.workers;
    let engine = Arc::new(Engine::new(
        store.pool.clone(),
        Arc::new(config.clone()),
        Arc::clone(&store.routing),
        Arc::new(steps),
        run_id.clone(),
    ));

    let report = discovery::discover(&store.pool, config, &store.routing, None, false).await?;
    info!(
        run_id = %run_id,
        enqueued = report.queue_ids.len(),
        routing_changed = report.routing_changed,
        "startup discovery finished"
    );

    let listener = server::bind(&config.daemon.bind).await?;
    let addr = listener.local_addr()?.to_string();
    lock.set_control_addr(&addr)?;

    let handles = engine.spawn_workers(workers);
    let server_task = tokio::spawn(server::serve(Arc::clone(&engine), listener, workers));
    println!("strata daemon {} listening on http://{}", run_id, addr);

    let token = engine.shutdown_token();
    tokio::select! {
        _ = token.cancelled() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for interrupt");
            }
            info!("interrupt received; draining");
            engine.shutdown();
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task panicked");
        }
    }
    match server_task.await {
        Ok(Err(e)) => warn!(error = %e, "control plane exited with error"),
        Err(e) => warn!(error = %e, "control plane task panicked"),
        Ok(Ok(())) => {}
    }

    let summary = queue::summarize_session(&store.pool, &run_id).await?;
    finish_run(&store.pool, &run_id, &summary).await?;
    info!(
        run_id = %run_id,
        built = summary.built,
        reused = summary.reused,
        failed = summary.failed,
        "daemon stopped"
    );

    store.pool.close().await;
    lock.release();
    Ok(())
}

/// Open and validate the store. Callers must already hold the writer lock.
pub async fn open_store(config: &Config, steps: &StepRegistry, opts: StartOptions) -> Result<Store> {
    let pool = db::connect(config)
        .await
        .with_context(|| format!("failed to open store {}", config.db.path.display()))?;
    migrate::run_migrations(&pool).await?;

    if opts.fresh {
        warn!("--fresh: truncating the store");
        migrate::reset_fresh(&pool).await?;
    }

    let routing = RoutingTable::load(&config.routing.path)?;
    for step in routing.referenced_steps() {
        if steps.find(step).is_none() {
            anyhow::bail!("routing table references unknown step '{}'", step);
        }
    }

    let store = Store {
        pool,
        routing: Arc::new(routing),
    };
    check_tool_versions(&store.pool, steps, opts.accept_tool_versions).await?;
    Ok(store)
}

/// Compare the running step versions with the ones the store was built
/// with.
///
/// A fresh store simply records them. A mismatch is refused unless
/// `accept` is set, in which case the new versions are recorded and every
/// routed file is enqueued at bulk priority. Returns the number of files
/// enqueued.
pub async fn check_tool_versions(pool: &SqlitePool, steps: &StepRegistry, accept: bool) -> Result<usize> {
    let running = steps.tool_versions();
    let stored: Option<BTreeMap<String, String>> = match migrate::get_meta(pool, META_TOOL_VERSIONS).await? {
        Some(json) => Some(serde_json::from_str(&json).context("corrupt tool_versions metadata")?),
        None => None,
    };

    let Some(stored) = stored else {
        migrate::set_meta(pool, META_TOOL_VERSIONS, &serde_json::to_string(&running)?).await?;
        return Ok(0);
    };

    let changed: BTreeMap<String, (String, String)> = stored
        .iter()
        .filter_map(|(step, old)| {
            running
                .get(step)
                .filter(|new| *new != old)
                .map(|new| (step.clone(), (old.clone(), new.clone())))
        })
        .collect();

    if changed.is_empty() {
        if stored != running {
            migrate::set_meta(pool, META_TOOL_VERSIONS, &serde_json::to_string(&running)?).await?;
        }
        return Ok(0);
    }
    if !accept {
        return Err(DaemonError::ToolVersionMismatch { changed }.into());
    }

    migrate::set_meta(pool, META_TOOL_VERSIONS, &serde_json::to_string(&running)?).await?;
    let file_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM files WHERE envelope != ? ORDER BY id")
        .bind(SKIP_ENVELOPE)
        .fetch_all(pool)
        .await?;
    queue::enqueue_files(pool, &file_ids, priority::BULK).await?;
    info!(
        steps = ?changed.keys().collect::<Vec<_>>(),
        files = file_ids.len(),
        "accepted new step versions; affected files enqueued"
    );
    Ok(file_ids.len())
}

/// Run id for this process: inherited from a detaching parent or fresh.
pub fn run_id() -> String {
    std::env::var(RUN_ID_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub async fn start_run(pool: &SqlitePool, run_id: &str, mode: &str) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO runs (id, mode, started_at) VALUES (?, ?, ?)")
        .bind(run_id)
        .bind(mode)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn finish_run(pool: &SqlitePool, run_id: &str, summary: &Summary) -> Result<()> {
    sqlx::query("UPDATE runs SET finished_at = ?, built = ?, reused = ?, failed = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp())
        .bind(summary.built)
        .bind(summary.reused)
        .bind(summary.failed)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}
