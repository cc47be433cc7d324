//! Worker execution engine.
//!
//! A worker claims one queue item at a time and walks the file's stored
//! envelope step by step. Before running a step it computes the signature
//! the step's output would have from the current inputs; if an artifact is
//! stored under that signature it is reused, otherwise the step runs and
//! its artifact is persisted (lease-guarded). The file's pointers and the
//! item's terminal status are written together in one transaction that
//! first re-checks lease ownership, so a worker that lost its lease never
//! overwrites the work of the one that reclaimed it.
//!
//! There is no global stage ordering: every file moves through its own
//! envelope independently.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts;
use crate::config::Config;
use crate::discovery::{self, Refresh};
use crate::error::StepError;
use crate::models::{Artifact, Outcome, QueueItem, QueueKind, QueueStatus};
use crate::queue::{self, RetryPolicy};
use crate::registry::{self, DEFINITIONS_STEP};
use crate::routing::RoutingTable;
use crate::signature::SignatureInputs;
use crate::steps::{StepInput, StepRegistry};

/// How one processed item ended, from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemResult {
    Done(Outcome),
    /// Transient failure; back in the queue after the retry delay.
    Retrying,
    Failed,
    Cancelled,
    /// Another worker reclaimed the item; this worker's result was dropped.
    LeaseLost,
}

/// Shared state for every worker of one session.
pub struct Engine {
    pool: SqlitePool,
    config: Arc<Config>,
    routing: Arc<RoutingTable>,
    steps: Arc<StepRegistry>,
    session_id: String,
    lease_ttl: Duration,
    notify: Notify,
    shutdown: CancellationToken,
    rebuilding: Mutex<()>,
}

impl Engine {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        routing: Arc<RoutingTable>,
        steps: Arc<StepRegistry>,
        session_id: String,
    ) -> Self {
        let lease_ttl = Duration::from_secs(config.daemon.lease_ttl_secs);
        Self {
            pool,
            config,
            routing,
            steps,
            session_id,
            lease_ttl,
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            rebuilding: Mutex::new(()),
        }
    }

    /// Override the lease TTL taken from the configuration.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Wake idle workers after new work was enqueued.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Stop claiming new items. In-flight items run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn `count` worker tasks.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|n| {
                let engine = Arc::clone(self);
                let worker = format!("{}:{}", engine.session_id, n);
                tokio::spawn(async move { engine.run_worker(worker).await })
            })
            .collect()
    }

    /// Claim-and-process loop for one worker, until shutdown.
    pub async fn run_worker(&self, worker: String) {
        let poll = Duration::from_millis(self.config.daemon.poll_interval_ms);
        debug!(worker = %worker, "worker started");

        while !self.shutdown.is_cancelled() {
            match self.step_once(&worker).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = %worker, error = %e, "worker error"),
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        debug!(worker = %worker, "worker stopped");
    }

    /// Claim and process at most one item.
    pub async fn step_once(&self, worker: &str) -> Result<Option<ItemResult>> {
        let Some(item) = queue::claim(&self.pool, worker, self.lease_ttl).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(&item, worker).await?))
    }

    /// Process items until nothing is pending or leased. Items waiting out
    /// a retry delay are waited for.
    pub async fn drain_until_idle(&self, worker: &str) -> Result<()> {
        let poll = Duration::from_millis(self.config.daemon.poll_interval_ms);
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            if self.step_once(worker).await?.is_some() {
                continue;
            }
            if queue::is_idle(&self.pool).await? {
                return Ok(());
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Process one claimed item while keeping its lease alive.
    pub async fn process(&self, item: &QueueItem, worker: &str) -> Result<ItemResult> {
        let _heartbeat = Heartbeat::start(self.pool.clone(), item.id, worker, self.lease_ttl);

        let processed = match item.kind {
            QueueKind::File => self.process_file(item, worker).await,
            QueueKind::Scan => self.process_scan(item, worker).await,
        };
        // Store and I/O errors are recorded on the item like any transient
        // step failure, so they count toward the attempt cap.
        let result = match processed {
            Ok(result) => result,
            Err(e) => {
                warn!(queue_id = item.id, worker = %worker, error = %e, "item errored");
                let err = StepError::Transient(format!("{:#}", e));
                self.fail(item, worker, item.kind.as_str(), &err).await?
            }
        };

        info!(
            queue_id = item.id,
            worker = %worker,
            result = ?result,
            "item finished"
        );

        if matches!(result, ItemResult::Done(_)) {
            self.rebuild_registry_if_due().await;
        }
        Ok(result)
    }

    async fn process_file(&self, item: &QueueItem, worker: &str) -> Result<ItemResult> {
        let file = match item.file_id {
            Some(id) => discovery::file(&self.pool, id).await?,
            None => None,
        };
        let Some(file) = file else {
            // Removed by a rescan after it was enqueued.
            return self.release(item, worker, QueueStatus::Cancelled, None).await;
        };
        let Some(cv) = discovery::content_version_by_id(&self.pool, file.content_version_id).await? else {
            return self.release(item, worker, QueueStatus::Cancelled, None).await;
        };
        let absolute = Path::new(&cv.root).join(&file.relative_path);

        let file = match discovery::refresh_file(&self.pool, file, &absolute).await? {
            Refresh::Unchanged(f) => f,
            Refresh::Changed(f) => {
                debug!(queue_id = item.id, path = %f.relative_path, "file changed since discovery");
                f
            }
            Refresh::Missing => {
                warn!(queue_id = item.id, path = %absolute.display(), "file vanished; cancelling");
                return self.release(item, worker, QueueStatus::Cancelled, None).await;
            }
            Refresh::Unreadable(reason) => {
                warn!(queue_id = item.id, path = %absolute.display(), error = %reason, "file unreadable");
                let err = StepError::Transient(reason);
                return self.fail(item, worker, "refresh", &err).await;
            }
        };

        let Some(steps) = discovery::envelope_steps(&self.pool, &file.envelope).await? else {
            let err = StepError::Derivation(format!("envelope '{}' is not recorded", file.envelope));
            return self.fail(item, worker, "envelope", &err).await;
        };
        let plan = match self.steps.plan(&steps) {
            Ok(p) => p,
            Err(e) => {
                let err = StepError::Derivation(e.to_string());
                return self.fail(item, worker, "envelope", &err).await;
            }
        };

        let mut signatures: Vec<String> = Vec::with_capacity(steps.len());
        let mut loaded: Vec<Option<Artifact>> = Vec::with_capacity(steps.len());
        let mut executed = false;

        for (i, name) in steps.iter().enumerate() {
            // Step boundary: the only place cancellation is observed.
            if !self.still_owned(item.id, worker).await? {
                return self.lost_or_cancelled(item.id).await;
            }

            let Some(step) = self.steps.find(name) else {
                let err = StepError::Derivation(format!("unknown step '{}'", name));
                return self.fail(item, worker, name, &err).await;
            };
            let upstream_sig = plan[i].map(|j| signatures[j].as_str());
            let signature = SignatureInputs {
                content_hash: &file.content_hash,
                step: name,
                tool_version: step.version(),
                upstream: upstream_sig,
            }
            .compute();

            if artifacts::exists(&self.pool, &signature).await? {
                debug!(queue_id = item.id, step = %name, "artifact valid; reusing");
                signatures.push(signature);
                loaded.push(None);
                continue;
            }

            let upstream = match plan[i] {
                Some(j) => {
                    if loaded[j].is_none() {
                        match artifacts::load(&self.pool, &signatures[j]).await {
                            Ok(artifact) => loaded[j] = artifact,
                            Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                                let err = StepError::Derivation(format!(
                                    "stored '{}' artifact is unreadable: {}",
                                    steps[j], e
                                ));
                                return self.fail(item, worker, name, &err).await;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    loaded[j].as_ref()
                }
                None => None,
            };

            let output = match self
                .steps
                .invoke(
                    name,
                    StepInput {
                        file: &file,
                        path: &absolute,
                        upstream,
                    },
                )
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    warn!(
                        queue_id = item.id,
                        step = %name,
                        path = %file.relative_path,
                        error = %err,
                        "step failed"
                    );
                    return self.fail(item, worker, name, &err).await;
                }
            };

            let artifact = Artifact {
                signature: signature.clone(),
                step: name.clone(),
                content_hash: file.content_hash.clone(),
                tool_version: step.version().to_string(),
                upstream_signature: upstream_sig.map(str::to_string),
                payload: output.payload.clone(),
            };
            if !artifacts::persist(&self.pool, item.id, worker, &artifact, &output).await? {
                return self.lost_or_cancelled(item.id).await;
            }

            executed = true;
            signatures.push(signature);
            loaded.push(Some(artifact));
        }

        let outcome = if executed {
            Outcome::Built
        } else {
            Outcome::Reused
        };
        self.commit_file(item, worker, file.id, &steps, &signatures, outcome)
            .await
    }

    /// Final write: pointers, watermark and `done`, in one transaction that
    /// first re-checks the lease.
    async fn commit_file(
        &self,
        item: &QueueItem,
        worker: &str,
        file_id: i64,
        steps: &[String],
        signatures: &[String],
        outcome: Outcome,
    ) -> Result<ItemResult> {
        let mut tx = self.pool.begin().await?;

        if !queue::hold_lease(&mut *tx, item.id, worker).await? {
            drop(tx);
            return self.lost_or_cancelled(item.id).await;
        }

        let mut definitions_moved = false;
        for (step, signature) in steps.iter().zip(signatures) {
            let moved = artifacts::set_pointer(&mut *tx, file_id, step, signature).await?;
            definitions_moved |= moved && step == DEFINITIONS_STEP;
        }
        let dropped = artifacts::retain_pointers(&mut *tx, file_id, steps).await?;
        if dropped > 0 && !steps.iter().any(|s| s == DEFINITIONS_STEP) {
            definitions_moved = true;
        }
        if definitions_moved {
            registry::bump_watermark(&mut *tx).await?;
        }

        queue::finish(
            &mut *tx,
            item.id,
            worker,
            QueueStatus::Done,
            Some(outcome),
            &self.session_id,
        )
        .await?;
        tx.commit().await?;

        Ok(ItemResult::Done(outcome))
    }

    async fn process_scan(&self, item: &QueueItem, worker: &str) -> Result<ItemResult> {
        let cv = match item.content_version_id {
            Some(id) => discovery::content_version_by_id(&self.pool, id).await?,
            None => None,
        };
        let Some(cv) = cv else {
            return self.release(item, worker, QueueStatus::Cancelled, None).await;
        };

        match discovery::discover(&self.pool, &self.config, &self.routing, Some(&cv.name), false).await {
            Ok(report) => {
                if !report.queue_ids.is_empty() {
                    self.wake();
                }
                self.release(item, worker, QueueStatus::Done, Some(Outcome::Scanned))
                    .await
            }
            Err(e) => {
                let err = StepError::Transient(e.to_string());
                self.fail(item, worker, "scan", &err).await
            }
        }
    }

    async fn still_owned(&self, queue_id: i64, worker: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        queue::owns_lease(&mut *conn, queue_id, worker).await
    }

    async fn lost_or_cancelled(&self, queue_id: i64) -> Result<ItemResult> {
        let status = queue::get(&self.pool, queue_id).await?.map(|i| i.status);
        Ok(match status {
            Some(QueueStatus::Cancelled) => ItemResult::Cancelled,
            _ => ItemResult::LeaseLost,
        })
    }

    async fn release(
        &self,
        item: &QueueItem,
        worker: &str,
        status: QueueStatus,
        outcome: Option<Outcome>,
    ) -> Result<ItemResult> {
        if !queue::release(&self.pool, item.id, worker, status, outcome, &self.session_id).await? {
            return self.lost_or_cancelled(item.id).await;
        }
        Ok(match (status, outcome) {
            (QueueStatus::Done, Some(o)) => ItemResult::Done(o),
            (QueueStatus::Failed, _) => ItemResult::Failed,
            _ => ItemResult::Cancelled,
        })
    }

    async fn fail(&self, item: &QueueItem, worker: &str, step: &str, err: &StepError) -> Result<ItemResult> {
        let policy = RetryPolicy::from(&self.config.daemon);
        let status = queue::fail(&self.pool, item, worker, step, err, policy, &self.session_id).await?;
        Ok(match status {
            Some(QueueStatus::Pending) => ItemResult::Retrying,
            Some(_) => ItemResult::Failed,
            None => self.lost_or_cancelled(item.id).await?,
        })
    }

    async fn rebuild_registry_if_due(&self) {
        // One rebuild at a time; a busy lock means one is already running.
        let Ok(_guard) = self.rebuilding.try_lock() else {
            return;
        };
        if let Err(e) = registry::maybe_rebuild(&self.pool, self.config.registry.rebuild_threshold).await {
            warn!(error = %e, "registry rebuild failed");
        }
    }
}

/// Renews a lease every `ttl / 3` until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(pool: SqlitePool, queue_id: i64, worker: &str, ttl: Duration) -> Self {
        let worker = worker.to_string();
        let period = (ttl / 3).max(Duration::from_millis(10));
        Self(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match queue::renew(&pool, queue_id, &worker, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(queue_id, worker = %worker, "lease no longer owned; heartbeat stopped");
                        break;
                    }
                    Err(e) => warn!(queue_id, error = %e, "lease renewal failed"),
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContentVersionConfig, DaemonConfig, DbConfig, RegistryConfig, RoutingConfig};
    use crate::migrate::memory_pool;
    use crate::models::priority;
    use tempfile::TempDir;

    const ROUTES: &str = r#"
version = 1

[envelopes]
script = ["ingest", "parse", "extract-definitions", "extract-references"]
table = ["ingest", "parse-table", "extract-definitions"]

[[routes]]
pattern = "**/*.txt"
envelope = "script"

[[routes]]
pattern = "**/*.csv"
envelope = "table"
"#;

    fn engine(pool: SqlitePool, root: &Path) -> Engine {
        let config = Config {
            db: DbConfig {
                path: root.join("store.sqlite"),
            },
            daemon: DaemonConfig {
                poll_interval_ms: 5,
                retry_delay_secs: 0,
                ..DaemonConfig::default()
            },
            routing: RoutingConfig {
                path: root.join("routes.toml"),
            },
            registry: RegistryConfig {
                rebuild_threshold: 1,
            },
            content_versions: vec![ContentVersionConfig {
                name: "base".into(),
                root: root.join("base"),
                writable: false,
                exclude_globs: vec![],
                follow_symlinks: false,
            }],
        };
        Engine::new(
            pool,
            Arc::new(config),
            Arc::new(RoutingTable::parse(ROUTES).unwrap()),
            Arc::new(StepRegistry::with_builtins()),
            "test-session".into(),
        )
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join("base").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    async fn discover(engine: &Engine) -> Vec<i64> {
        discovery::discover(engine.pool(), engine.config(), engine.routing(), None, false)
            .await
            .unwrap()
            .queue_ids
    }

    #[tokio::test]
    async fn builds_then_reuses() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "traits.txt", "brave = { opposites = { craven } }\ncraven = { }\n");
        write(tmp.path(), "names.csv", "key;text\nHELLO;Hi\n");
        let engine = engine(memory_pool().await, tmp.path());

        discover(&engine).await;
        engine.drain_until_idle("w").await.unwrap();

        let summary = queue::summarize_session(engine.pool(), "test-session").await.unwrap();
        assert_eq!(summary.built, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(engine.steps().invocation_count("ingest"), 2);

        // A threshold of one rebuilds the registry after every definitions change.
        let res = registry::resolve(engine.pool(), "craven", None).await.unwrap();
        assert_eq!(res.locations.len(), 1);
        assert_eq!(res.locations[0].kind, "block");

        // Forced re-enqueue of unchanged files runs no step at all.
        let file = discovery::find_file(engine.pool(), "base", "traits.txt").await.unwrap().unwrap();
        let ids = queue::enqueue_files(engine.pool(), &[file.id], priority::FLASH).await.unwrap();
        engine.drain_until_idle("w").await.unwrap();
        let summary = queue::summarize_ids(engine.pool(), &ids).await.unwrap();
        assert_eq!(summary.reused, 1);
        assert_eq!(engine.steps().invocation_count("ingest"), 2);
    }

    #[tokio::test]
    async fn derivation_error_fails_only_that_file() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "bad.txt", "broken = {\n");
        write(tmp.path(), "good.txt", "fine = yes\n");
        let engine = engine(memory_pool().await, tmp.path());

        discover(&engine).await;
        engine.drain_until_idle("w").await.unwrap();

        let summary = queue::summarize_session(engine.pool(), "test-session").await.unwrap();
        assert_eq!(summary.built, 1);
        assert_eq!(summary.failed, 1);
        let failures = queue::recent_failures(engine.pool(), 5).await.unwrap();
        assert_eq!(failures[0].step, "parse");
        assert_eq!(failures[0].kind, "derivation");
        assert_eq!(failures[0].path.as_deref(), Some("bad.txt"));
    }

    #[tokio::test]
    async fn late_worker_result_is_discarded() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = b\n");
        let engine = engine(memory_pool().await, tmp.path());
        let ids = discover(&engine).await;

        let stale = queue::claim(engine.pool(), "slow", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = queue::claim(engine.pool(), "fast", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.id, fresh.id);

        assert_eq!(engine.process(&stale, "slow").await.unwrap(), ItemResult::LeaseLost);
        assert_eq!(artifacts::count(engine.pool(), None).await.unwrap(), 0);

        assert_eq!(
            engine.process(&fresh, "fast").await.unwrap(),
            ItemResult::Done(Outcome::Built)
        );
        let summary = queue::summarize_ids(engine.pool(), &ids).await.unwrap();
        assert_eq!(summary.built, 1);
    }

    #[tokio::test]
    async fn cancelled_item_stops_at_step_boundary() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = b\n");
        let engine = engine(memory_pool().await, tmp.path());
        let ids = discover(&engine).await;

        let item = queue::claim(engine.pool(), "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue::cancel(engine.pool(), &ids, "test-session").await.unwrap();

        assert_eq!(engine.process(&item, "w").await.unwrap(), ItemResult::Cancelled);
        assert_eq!(engine.steps().invocation_count("ingest"), 0);
        assert!(artifacts::pointers(engine.pool(), item.file_id.unwrap())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn vanished_file_is_cancelled() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = b\n");
        let engine = engine(memory_pool().await, tmp.path());
        discover(&engine).await;
        std::fs::remove_file(tmp.path().join("base/a.txt")).unwrap();

        let result = engine.step_once("w").await.unwrap();
        assert_eq!(result, Some(ItemResult::Cancelled));
    }

    #[tokio::test]
    async fn deferred_scan_discovers_and_builds() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = b\n");
        let engine = engine(memory_pool().await, tmp.path());
        let cv_id = discovery::ensure_content_version(engine.pool(), &engine.config().content_versions[0], 0)
            .await
            .unwrap();
        let scan = queue::enqueue_scan_item(engine.pool(), cv_id, priority::NORMAL)
            .await
            .unwrap();

        assert_eq!(
            engine.step_once("w").await.unwrap(),
            Some(ItemResult::Done(Outcome::Scanned))
        );
        engine.drain_until_idle("w").await.unwrap();
        let summary = queue::summarize_session(engine.pool(), "test-session").await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.built, 1);
        assert_eq!(queue::get(engine.pool(), scan).await.unwrap().unwrap().status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn unreadable_file_is_retried_then_failed() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "a = b\n");
        let engine = engine(memory_pool().await, tmp.path());
        let ids = discover(&engine).await;

        let path = tmp.path().join("base/a.txt");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let mut results = Vec::new();
        while let Some(result) = engine.step_once("w").await.unwrap() {
            results.push(result);
        }
        assert_eq!(
            results,
            vec![ItemResult::Retrying, ItemResult::Retrying, ItemResult::Failed]
        );

        let item = queue::get(engine.pool(), ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempt_count, 3);
        assert_eq!(item.last_error_kind.as_deref(), Some("transient"));
        assert_eq!(queue::recent_failures(engine.pool(), 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unreadable_upstream_artifact_fails_the_item() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "brave = { }\n");
        let engine = engine(memory_pool().await, tmp.path());
        discover(&engine).await;
        engine.drain_until_idle("w").await.unwrap();

        // The tree is stored but can no longer be decoded; extraction must rerun.
        sqlx::query("UPDATE artifacts SET payload = '{' WHERE step = 'parse'")
            .execute(engine.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM artifacts WHERE step = 'extract-definitions'")
            .execute(engine.pool())
            .await
            .unwrap();

        let file = discovery::find_file(engine.pool(), "base", "a.txt").await.unwrap().unwrap();
        let ids = queue::enqueue_files(engine.pool(), &[file.id], priority::FLASH).await.unwrap();
        assert_eq!(engine.step_once("w").await.unwrap(), Some(ItemResult::Failed));

        let failures = queue::recent_failures(engine.pool(), 1).await.unwrap();
        assert_eq!(failures[0].queue_id, ids[0]);
        assert_eq!(failures[0].step, "extract-definitions");
        assert_eq!(failures[0].kind, "derivation");
    }

    #[tokio::test]
    async fn removed_file_moves_the_watermark() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.txt", "brave = { }\n");
        write(tmp.path(), "b.txt", "craven = { }\n");
        let engine = engine(memory_pool().await, tmp.path());
        discover(&engine).await;
        engine.drain_until_idle("w").await.unwrap();

        let before = registry::watermark(engine.pool()).await.unwrap();
        let res = registry::resolve(engine.pool(), "craven", None).await.unwrap();
        assert_eq!(res.locations.len(), 1);

        std::fs::remove_file(tmp.path().join("base/b.txt")).unwrap();
        discover(&engine).await;
        assert_eq!(registry::watermark(engine.pool()).await.unwrap(), before + 1);

        assert!(registry::maybe_rebuild(engine.pool(), 1).await.unwrap().is_some());
        let res = registry::resolve(engine.pool(), "craven", None).await.unwrap();
        assert!(res.locations.is_empty());
    }
}
