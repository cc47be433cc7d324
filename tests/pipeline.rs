use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use strata::artifacts;
use strata::client::ControlClient;
use strata::config::{self, Config};
use strata::db;
use strata::discovery;
use strata::error::StepError;
use strata::migrate;
use strata::models::priority;
use strata::protocol::{EnqueueScanRequest, FileRef};
use strata::queue;
use strata::routing::RoutingTable;
use strata::server;
use strata::steps::{Step, StepInput, StepOutput, StepRegistry};
use strata::worker::Engine;

const ROUTES: &str = r#"
version = 1

[envelopes]
script = ["ingest", "parse", "extract-definitions", "extract-references"]
summary = ["ingest", "summarize"]

[[routes]]
pattern = "common/**/*.txt"
envelope = "script"

[[routes]]
pattern = "notes/*.md"
envelope = "summary"
"#;

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
}

fn setup(overlays: &[&str]) -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("base")).unwrap();
    fs::write(root.join("routes.toml"), ROUTES).unwrap();

    let mut body = String::from(
        r#"
[db]
path = "data/strata.sqlite"

[daemon]
bind = "127.0.0.1:0"
workers = 2
poll_interval_ms = 10
retry_delay_secs = 0

[routing]
path = "routes.toml"

[registry]
rebuild_threshold = 1

[[content_versions]]
name = "base"
root = "base"
"#,
    );
    for name in overlays {
        fs::create_dir_all(root.join(name)).unwrap();
        body.push_str(&format!(
            "\n[[content_versions]]\nname = \"{0}\"\nroot = \"{0}\"\nwritable = true\n",
            name
        ));
    }
    fs::write(root.join("strata.toml"), body).unwrap();
    let config = config::load_config(&root.join("strata.toml")).unwrap();

    Env {
        _tmp: tmp,
        root,
        config,
    }
}

fn write(root: &Path, cv: &str, rel: &str, body: &str) {
    let path = root.join(cv).join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Counts the words of a note; its version is chosen by the test.
struct Summarize(&'static str);

#[async_trait]
impl Step for Summarize {
    fn name(&self) -> &str {
        "summarize"
    }
    fn version(&self) -> &str {
        self.0
    }
    fn consumes(&self) -> Option<&[&str]> {
        Some(&["ingest"])
    }
    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let words = input.upstream_text()?.split_whitespace().count();
        Ok(StepOutput::payload(serde_json::json!({ "words": words })))
    }
}

fn steps(summarize_version: &'static str) -> StepRegistry {
    let mut steps = StepRegistry::with_builtins();
    steps.register(Box::new(Summarize(summarize_version)));
    steps
}

async fn engine(env: &Env, steps: StepRegistry, session: &str) -> Arc<Engine> {
    let pool = db::connect(&env.config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let routing = RoutingTable::load(&env.config.routing.path).unwrap();
    Arc::new(Engine::new(
        pool,
        Arc::new(env.config.clone()),
        Arc::new(routing),
        Arc::new(steps),
        session.to_string(),
    ))
}

async fn discover(engine: &Engine, force: bool) -> Vec<i64> {
    discovery::discover(engine.pool(), engine.config(), engine.routing(), None, force)
        .await
        .unwrap()
        .queue_ids
}

#[tokio::test]
async fn identical_content_shares_artifacts() {
    let env = setup(&[]);
    let body = "brave = { opposites = { craven } }\n";
    write(&env.root, "base", "common/a.txt", body);
    write(&env.root, "base", "common/b.txt", body);
    let engine = engine(&env, steps("1"), "s1").await;

    let ids = discover(&engine, false).await;
    assert_eq!(ids.len(), 2);
    engine.drain_until_idle("w").await.unwrap();

    let summary = queue::summarize_ids(engine.pool(), &ids).await.unwrap();
    assert_eq!(summary.built + summary.reused, 2);
    assert_eq!(summary.failed, 0);

    // One artifact per step, shared by both files
    for step in ["ingest", "parse", "extract-definitions", "extract-references"] {
        assert_eq!(artifacts::count(engine.pool(), Some(step)).await.unwrap(), 1, "{}", step);
    }
    let a = discovery::find_file(engine.pool(), "base", "common/a.txt").await.unwrap().unwrap();
    let b = discovery::find_file(engine.pool(), "base", "common/b.txt").await.unwrap().unwrap();
    assert_eq!(
        artifacts::pointers(engine.pool(), a.id).await.unwrap(),
        artifacts::pointers(engine.pool(), b.id).await.unwrap()
    );
    assert_eq!(engine.steps().invocation_count("parse"), 1);
}

#[tokio::test]
async fn signatures_gate_regeneration() {
    let env = setup(&[]);
    write(&env.root, "base", "notes/one.md", "three little words");

    let first = engine(&env, steps("1"), "s1").await;
    discover(&first, false).await;
    first.drain_until_idle("w").await.unwrap();
    assert_eq!(first.steps().invocation_count("summarize"), 1);
    first.pool().close().await;

    // Same versions: a forced pass finds every artifact valid
    let second = engine(&env, steps("1"), "s2").await;
    let ids = discover(&second, true).await;
    assert_eq!(ids.len(), 1);
    second.drain_until_idle("w").await.unwrap();
    assert_eq!(second.steps().invocation_count("ingest"), 0);
    assert_eq!(second.steps().invocation_count("summarize"), 0);
    let summary = queue::summarize_ids(second.pool(), &ids).await.unwrap();
    assert_eq!(summary.reused, 1);
    second.pool().close().await;

    // Bumped version: only the changed step runs again
    let third = engine(&env, steps("2"), "s3").await;
    let ids = discover(&third, true).await;
    third.drain_until_idle("w").await.unwrap();
    assert_eq!(third.steps().invocation_count("ingest"), 0);
    assert_eq!(third.steps().invocation_count("summarize"), 1);
    let summary = queue::summarize_ids(third.pool(), &ids).await.unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(artifacts::count(third.pool(), Some("summarize")).await.unwrap(), 2);
}

async fn store_shape(engine: &Engine) -> (BTreeSet<String>, BTreeSet<String>) {
    let files: Vec<(String, String, String, String)> = sqlx::query_as(
        r#"
        SELECT cv.name, f.relative_path, f.content_hash, f.envelope
        FROM files f JOIN content_versions cv ON cv.id = f.content_version_id
        "#,
    )
    .fetch_all(engine.pool())
    .await
    .unwrap();
    let items: Vec<(String, Option<String>, Option<String>, i64, String)> = sqlx::query_as(
        r#"
        SELECT q.kind, cv.name, f.relative_path, q.priority, q.status
        FROM queue_items q
        LEFT JOIN files f ON f.id = q.file_id
        LEFT JOIN content_versions cv ON cv.id = f.content_version_id
        "#,
    )
    .fetch_all(engine.pool())
    .await
    .unwrap();

    (
        files.into_iter().map(|f| format!("{:?}", f)).collect(),
        items.into_iter().map(|i| format!("{:?}", i)).collect(),
    )
}

#[tokio::test]
async fn fresh_reset_then_discover_is_reproducible() {
    let env = setup(&["mod"]);
    write(&env.root, "base", "common/a.txt", "brave = { }\n");
    write(&env.root, "base", "common/b.txt", "craven = { }\n");
    write(&env.root, "base", "gfx/icon.dds", "binary");
    write(&env.root, "mod", "common/a.txt", "brave = { extra = yes }\n");
    let engine = engine(&env, steps("1"), "s1").await;

    discover(&engine, false).await;
    let before = store_shape(&engine).await;
    assert_eq!(before.0.len(), 4);
    assert_eq!(before.1.len(), 3);

    migrate::reset_fresh(engine.pool()).await.unwrap();
    discover(&engine, false).await;
    assert_eq!(store_shape(&engine).await, before);

    // And again: the reset itself is idempotent
    migrate::reset_fresh(engine.pool()).await.unwrap();
    migrate::reset_fresh(engine.pool()).await.unwrap();
    discover(&engine, false).await;
    assert_eq!(store_shape(&engine).await, before);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_late_write_dropped() {
    let env = setup(&[]);
    write(&env.root, "base", "common/a.txt", "brave = { }\n");
    let engine = engine(&env, steps("1"), "s1").await;
    discover(&engine, false).await;

    // The first worker claims and then stalls past its lease
    let stalled = queue::claim(engine.pool(), "s1:dead", Duration::ZERO).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reclaimed = queue::claim(engine.pool(), "s1:live", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, stalled.id);
    assert_eq!(reclaimed.attempt_count, stalled.attempt_count);

    // The stalled worker cannot release or renew any more
    assert!(!queue::renew(engine.pool(), stalled.id, "s1:dead", Duration::from_secs(60)).await.unwrap());
    let result = engine.process(&stalled, "s1:dead").await.unwrap();
    assert_eq!(result, strata::worker::ItemResult::LeaseLost);

    let result = engine.process(&reclaimed, "s1:live").await.unwrap();
    assert!(matches!(result, strata::worker::ItemResult::Done(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_share_a_file_store() {
    let mut env = setup(&[]);
    env.config.daemon.workers = 8;
    for i in 0..200 {
        write(
            &env.root,
            "base",
            &format!("common/f{:03}.txt", i),
            &format!("trait_{0} = {{ opposites = {{ trait_{1} }} }}\n", i, i + 1),
        );
    }
    let engine = engine(&env, steps("1"), "s1").await;
    let ids = discover(&engine, false).await;
    assert_eq!(ids.len(), 200);

    let mut tasks = Vec::new();
    for n in 0..8 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine.drain_until_idle(&format!("s1:{}", n)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let summary = queue::summarize_ids(engine.pool(), &ids).await.unwrap();
    assert_eq!(summary.built + summary.reused, 200, "{:?}", summary);
    assert_eq!(summary.failed, 0, "{:?}", summary);
    assert!(summary.idle);
    assert!(queue::recent_failures(engine.pool(), 1).await.unwrap().is_empty());
}

async fn serve(env: &Env, session: &str) -> (Arc<Engine>, ControlClient, tokio::task::JoinHandle<()>) {
    let engine = engine(env, steps("1"), session).await;
    let listener = server::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let workers = engine.spawn_workers(2);

    let e = Arc::clone(&engine);
    let handle = tokio::spawn(async move {
        server::serve(e, listener, 2).await.unwrap();
        for w in workers {
            w.await.unwrap();
        }
    });
    let client = ControlClient::new(&addr, "pipeline-test").unwrap();
    (engine, client, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_reports_one_built_one_reused() {
    let env = setup(&[]);
    write(&env.root, "base", "common/old.txt", "brave = { opposites = { craven } }\n");

    // Earlier session leaves valid artifacts for old.txt
    {
        let engine = engine(&env, steps("1"), "earlier").await;
        discover(&engine, false).await;
        engine.drain_until_idle("w").await.unwrap();
        engine.pool().close().await;
    }

    write(&env.root, "base", "common/new.txt", "craven = { }\n");
    let (_engine, client, handle) = serve(&env, "daemon").await;

    let scan = client
        .enqueue_scan(&EnqueueScanRequest {
            force: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(scan.queue_ids.len(), 2);

    let summary = client
        .await_idle(Duration::from_secs(20), Some(scan.queue_ids.clone()))
        .await
        .unwrap();
    assert!(summary.idle);
    assert_eq!((summary.built, summary.reused, summary.failed), (1, 1, 0));

    client.snapshot().await.unwrap();
    let res = client.resolve("craven", None).await.unwrap();
    assert_eq!(res.locations.len(), 1);
    assert_eq!(res.locations[0].relative_path, "common/new.txt");

    let status = client.status().await.unwrap();
    assert_eq!(status.queue.get("failed"), Some(&0));
    assert_eq!(status.invocations.get("ingest"), Some(&1));

    client.shutdown().await.unwrap();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flash_edit_and_remote_errors() {
    let env = setup(&["mod"]);
    write(&env.root, "base", "common/a.txt", "brave = { }\n");
    let (_engine, client, handle) = serve(&env, "daemon").await;
    client.enqueue_scan(&EnqueueScanRequest::default()).await.unwrap();
    let idle = client.await_idle(Duration::from_secs(20), None).await.unwrap();
    assert!(idle.idle);
    assert_eq!(idle.built, 1);

    write(&env.root, "mod", "common/a.txt", "brave = { mod = yes }\n");
    let ids = client
        .enqueue_files(
            vec![FileRef {
                content_version: "mod".into(),
                path: "common/a.txt".into(),
            }],
            priority::FLASH,
        )
        .await
        .unwrap();
    let waited = client.wait(ids.clone(), Duration::from_secs(20)).await.unwrap();
    assert!(waited.summary.idle);
    assert_eq!(waited.summary.built, 1);

    client.snapshot().await.unwrap();
    let res = client.resolve("brave", None).await.unwrap();
    let layers: Vec<i64> = res.locations.iter().map(|l| l.layer).collect();
    assert_eq!(layers, vec![0, 1]);

    let err = client
        .enqueue_files(
            vec![FileRef {
                content_version: "nope".into(),
                path: "a.txt".into(),
            }],
            priority::FLASH,
        )
        .await
        .unwrap_err();
    match err {
        strata::error::ClientError::Remote { code, .. } => assert_eq!(code, "bad_request"),
        other => panic!("expected a remote error, got {:?}", other),
    }

    client.shutdown().await.unwrap();
    handle.await.unwrap();
}
