//! One-shot bulk builds (`strata build`).
//!
//! If a daemon already serves the store, the build is a pure control-plane
//! client: it requests a scan and waits for those items. Otherwise it takes
//! the writer lock itself, discovers, and drains the queue with its own
//! workers. Either way derivation only ever happens inside the worker
//! pipeline.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::client::ControlClient;
use crate::config::Config;
use crate::daemon::{self, StartOptions, RUN_ID_ENV};
use crate::discovery;
use crate::lock::WriterLock;
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::protocol::EnqueueScanRequest;
use crate::queue::{self, Summary};
use crate::steps::StepRegistry;
use crate::worker::Engine;

const PROGRESS_EVERY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// A running daemon did the work.
    Client,
    /// This process held the writer lock and ran its own workers.
    Writer,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub run_id: String,
    pub mode: BuildMode,
    pub enqueued: usize,
    pub summary: Summary,
    /// False when the timeout elapsed before the queue went idle.
    pub completed: bool,
}

pub async fn run_build(
    config: &Config,
    timeout: Duration,
    progress: &dyn BuildProgressReporter,
) -> Result<BuildReport> {
    run_build_with_steps(config, StepRegistry::with_builtins(), timeout, progress).await
}

pub async fn run_build_with_steps(
    config: &Config,
    steps: StepRegistry,
    timeout: Duration,
    progress: &dyn BuildProgressReporter,
) -> Result<BuildReport> {
    let run_id = daemon::run_id();

    if let Some(client) = ControlClient::connect_running(config, &format!("build:{}", run_id)).await {
        info!(run_id = %run_id, daemon = %client.base_url(), "daemon reachable; building through the control plane");
        return build_via_daemon(&client, run_id, timeout, progress).await;
    }
    build_as_writer(config, steps, run_id, timeout, progress).await
}

async fn build_via_daemon(
    client: &ControlClient,
    run_id: String,
    timeout: Duration,
    progress: &dyn BuildProgressReporter,
) -> Result<BuildReport> {
    progress.report(BuildProgressEvent::Discovering);
    let scan = client.enqueue_scan(&EnqueueScanRequest::default()).await?;
    let total = scan.queue_ids.len();

    let deadline = Instant::now() + timeout;
    let summary = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = remaining.min(PROGRESS_EVERY);
        let summary = client.await_idle(slice, Some(scan.queue_ids.clone())).await?;
        progress.report(BuildProgressEvent::from_summary(&summary, total));
        if summary.idle || remaining.is_zero() {
            break summary;
        }
    };

    Ok(BuildReport {
        run_id,
        mode: BuildMode::Client,
        enqueued: total,
        completed: summary.idle,
        summary,
    })
}

async fn build_as_writer(
    config: &Config,
    steps: StepRegistry,
    run_id: String,
    timeout: Duration,
    progress: &dyn BuildProgressReporter,
) -> Result<BuildReport> {
    let lock = WriterLock::acquire(&config.lock_path(), &config.db.path, &run_id)?;
    info!(run_id = %run_id, "no daemon running; building as the writer");

    let store = daemon::open_store(config, &steps, StartOptions::default()).await?;
    daemon::start_run(&store.pool, &run_id, "build").await?;

    let engine = Arc::new(Engine::new(
        store.pool.clone(),
        Arc::new(config.clone()),
        Arc::clone(&store.routing),
        Arc::new(steps),
        run_id.clone(),
    ));

    progress.report(BuildProgressEvent::Discovering);
    let report = discovery::discover(&store.pool, config, &store.routing, None, false).await?;
    let total = report.queue_ids.len();

    let handles = engine.spawn_workers(config.daemon.workers);
    let deadline = Instant::now() + timeout;
    let mut completed = false;
    loop {
        let summary = queue::summarize_ids(&store.pool, &report.queue_ids).await?;
        progress.report(BuildProgressEvent::from_summary(&summary, total));
        if queue::is_idle(&store.pool).await? {
            completed = true;
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(PROGRESS_EVERY.min(deadline.saturating_duration_since(Instant::now())))
            .await;
    }

    engine.shutdown();
    for handle in handles {
        let _ = handle.await;
    }

    let summary = queue::summarize_ids(&store.pool, &report.queue_ids).await?;
    daemon::finish_run(&store.pool, &run_id, &summary).await?;
    store.pool.close().await;
    lock.release();

    Ok(BuildReport {
        run_id,
        mode: BuildMode::Writer,
        enqueued: total,
        summary,
        completed,
    })
}

/// A build re-launched in the background.
#[derive(Debug, Clone)]
pub struct Detached {
    pub run_id: String,
    pub pid: u32,
    pub log: PathBuf,
}

/// Re-launch the current binary as a detached `build` whose output goes to
/// `<runs dir>/<run_id>.log`.
pub fn spawn_detached(config: &Config, config_path: &std::path::Path, extra_args: &[String]) -> Result<Detached> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let runs = config.runs_dir();
    fs::create_dir_all(&runs).with_context(|| format!("failed to create {}", runs.display()))?;
    let log = runs.join(format!("{}.log", run_id));
    let out = File::create(&log).with_context(|| format!("failed to create {}", log.display()))?;
    let err = out.try_clone()?;

    let exe = std::env::current_exe().context("cannot locate the strata binary")?;
    let mut cmd = Command::new(exe);
    cmd.arg("--config")
        .arg(config_path)
        .arg("build")
        .args(extra_args)
        .env(RUN_ID_ENV, &run_id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group: a terminal hangup on the launcher does not reach it.
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("failed to spawn detached build")?;
    Ok(Detached {
        run_id,
        pid: child.id(),
        log,
    })
}
