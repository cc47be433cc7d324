//! Control plane: the daemon's loopback HTTP API.
//!
//! Every mutation other processes make to a running daemon's state goes
//! through these handlers; they call the same queue, discovery and registry
//! functions the workers use, so there is one writer even with many
//! clients.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/enqueue_files` | Enqueue named files at a priority |
//! | `POST` | `/enqueue_scan` | Run (or queue) discovery for content versions |
//! | `POST` | `/await_idle` | Block until idle or timeout; completion summary |
//! | `POST` | `/wait` | Block until the given items finish or timeout |
//! | `POST` | `/cancel` | Cancel pending or leased items |
//! | `POST` | `/registry/snapshot` | Build a registry snapshot now |
//! | `POST` | `/registry/resolve` | Resolve a name against a snapshot |
//! | `POST` | `/registry/resolve_file` | Resolve every reference of one file |
//! | `POST` | `/gc` | Drop unreferenced artifacts and old snapshots |
//! | `POST` | `/shutdown` | Stop claiming, drain, exit |
//! | `GET`  | `/status` | Queue depth, leases, failures, step counters |
//! | `GET`  | `/health` | Lock holder, store reachability, version |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown content version: 'x'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `shutting_down` (503),
//! `internal` (500).

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::artifacts;
use crate::db;
use crate::discovery;
use crate::error::DaemonError;
use crate::lock;
use crate::models::priority;
use crate::protocol::*;
use crate::queue::{self, Summary};
use crate::registry::{self, Resolution, ResolvedReference, Snapshot, KEEP_SNAPSHOTS};
use crate::status;
use crate::worker::Engine;

/// Longest a single `wait`/`await_idle` request may block.
const MAX_WAIT: Duration = Duration::from_secs(600);
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    workers: usize,
    started_at: Instant,
}

/// Bind the control-plane listener, refusing anything but loopback.
pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let parsed: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid control plane address: {}", addr))?;
    if !parsed.ip().is_loopback() {
        return Err(DaemonError::NonLocalBind(addr.to_string()).into());
    }
    let listener = TcpListener::bind(parsed)
        .await
        .with_context(|| format!("failed to bind control plane on {}", addr))?;
    Ok(listener)
}

/// Serve the control plane until the engine's shutdown token fires.
pub async fn serve(engine: Arc<Engine>, listener: TcpListener, workers: usize) -> anyhow::Result<()> {
    let shutdown = engine.shutdown_token();
    let state = AppState {
        engine,
        workers,
        started_at: Instant::now(),
    };

    let app = router(state);
    info!(addr = %listener.local_addr()?, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/enqueue_files", post(handle_enqueue_files))
        .route("/enqueue_scan", post(handle_enqueue_scan))
        .route("/await_idle", post(handle_await_idle))
        .route("/wait", post(handle_wait))
        .route("/cancel", post(handle_cancel))
        .route("/registry/snapshot", post(handle_snapshot))
        .route("/registry/resolve", post(handle_resolve))
        .route("/registry/resolve_file", post(handle_resolve_file))
        .route("/gc", post(handle_gc))
        .route("/shutdown", post(handle_shutdown))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn(log_client))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn log_client(req: Request, next: Next) -> Response {
    let client = req
        .headers()
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    debug!(client = %client, method = %req.method(), path = %req.uri().path(), "control request");
    next.run(req).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn shutting_down() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "shutting_down".to_string(),
        message: "daemon is draining and accepts no new work".to_string(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

/// Map a store-level error to the closest status code.
fn classify(err: anyhow::Error) -> AppError {
    let msg = format!("{:#}", err);
    if msg.contains("not found") || msg.contains("no registry snapshot") {
        not_found(msg)
    } else if msg.contains("unknown content version") {
        bad_request(msg)
    } else {
        internal(err)
    }
}

fn reject_when_draining(state: &AppState) -> Result<(), AppError> {
    if state.engine.is_shutting_down() {
        return Err(shutting_down());
    }
    Ok(())
}

fn wait_budget(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms).min(MAX_WAIT)
}

// ============ POST /enqueue_files ============

async fn handle_enqueue_files(
    State(state): State<AppState>,
    Json(req): Json<EnqueueFilesRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    reject_when_draining(&state)?;
    if req.files.is_empty() {
        return Err(bad_request("files must not be empty"));
    }

    let engine = &state.engine;
    let mut file_ids = Vec::with_capacity(req.files.len());
    for f in &req.files {
        let id = discovery::register_path(
            engine.pool(),
            engine.config(),
            engine.routing(),
            &f.content_version,
            &f.path,
        )
        .await
        .map_err(classify)?;
        file_ids.push(id);
    }

    let queue_ids = queue::enqueue_files(engine.pool(), &file_ids, req.priority)
        .await
        .map_err(internal)?;
    engine.wake();
    info!(files = file_ids.len(), priority = req.priority, "files enqueued");
    Ok(Json(EnqueueResponse { queue_ids }))
}

// ============ POST /enqueue_scan ============

async fn handle_enqueue_scan(
    State(state): State<AppState>,
    Json(req): Json<EnqueueScanRequest>,
) -> Result<Json<EnqueueScanResponse>, AppError> {
    reject_when_draining(&state)?;
    let engine = &state.engine;
    let config = engine.config();

    for name in &req.content_versions {
        if config.content_version(name).is_none() {
            return Err(bad_request(format!("unknown content version: '{}'", name)));
        }
    }

    if req.defer {
        let mut queue_ids = Vec::new();
        for (layer, cv) in config.content_versions.iter().enumerate() {
            if !req.content_versions.is_empty() && !req.content_versions.contains(&cv.name) {
                continue;
            }
            let cv_id = discovery::ensure_content_version(engine.pool(), cv, layer as i64)
                .await
                .map_err(internal)?;
            let id = queue::enqueue_scan_item(engine.pool(), cv_id, priority::NORMAL)
                .await
                .map_err(internal)?;
            queue_ids.push(id);
        }
        engine.wake();
        return Ok(Json(EnqueueScanResponse {
            queue_ids,
            report: None,
        }));
    }

    let mut report = discovery::DiscoveryReport::default();
    let targets: Vec<Option<&str>> = if req.content_versions.is_empty() {
        vec![None]
    } else {
        req.content_versions.iter().map(|n| Some(n.as_str())).collect()
    };
    for only in targets {
        let r = discovery::discover(engine.pool(), config, engine.routing(), only, req.force)
            .await
            .map_err(classify)?;
        report.routing_changed |= r.routing_changed;
        report.content_versions.extend(r.content_versions);
        report.queue_ids.extend(r.queue_ids);
    }
    engine.wake();

    Ok(Json(EnqueueScanResponse {
        queue_ids: report.queue_ids.clone(),
        report: Some(report),
    }))
}

// ============ POST /await_idle, POST /wait ============

async fn handle_await_idle(
    State(state): State<AppState>,
    Json(req): Json<AwaitIdleRequest>,
) -> Result<Json<Summary>, AppError> {
    let deadline = Instant::now() + wait_budget(req.timeout_ms);
    let engine = &state.engine;
    loop {
        let summary = match &req.queue_ids {
            Some(ids) => queue::summarize_ids(engine.pool(), ids).await,
            None => queue::summarize_session(engine.pool(), engine.session_id()).await,
        }
        .map_err(internal)?;
        if summary.idle || Instant::now() >= deadline || engine.is_shutting_down() {
            return Ok(Json(summary));
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

async fn handle_wait(
    State(state): State<AppState>,
    Json(req): Json<WaitRequest>,
) -> Result<Json<WaitResponse>, AppError> {
    let deadline = Instant::now() + wait_budget(req.timeout_ms);
    let pool = state.engine.pool();
    loop {
        let items = queue::item_statuses(pool, &req.queue_ids)
            .await
            .map_err(internal)?;
        let finished = items.iter().all(|i| i.status.is_terminal());
        if finished || Instant::now() >= deadline || state.engine.is_shutting_down() {
            let summary = queue::summarize_ids(pool, &req.queue_ids)
                .await
                .map_err(internal)?;
            return Ok(Json(WaitResponse { items, summary }));
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

// ============ POST /cancel ============

async fn handle_cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, AppError> {
    let engine = &state.engine;
    let cancelled = queue::cancel(engine.pool(), &req.queue_ids, engine.session_id())
        .await
        .map_err(internal)?;
    info!(requested = req.queue_ids.len(), cancelled, "items cancelled");
    Ok(Json(CancelResponse { cancelled }))
}

// ============ Registry ============

async fn handle_snapshot(State(state): State<AppState>) -> Result<Json<Snapshot>, AppError> {
    let snapshot = registry::build_snapshot(state.engine.pool())
        .await
        .map_err(internal)?;
    Ok(Json(snapshot))
}

async fn handle_resolve(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Resolution>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let resolution = registry::resolve(state.engine.pool(), &req.name, req.snapshot_id)
        .await
        .map_err(classify)?;
    Ok(Json(resolution))
}

async fn handle_resolve_file(
    State(state): State<AppState>,
    Json(req): Json<ResolveFileRequest>,
) -> Result<Json<Vec<ResolvedReference>>, AppError> {
    let pool = state.engine.pool();
    let file = discovery::find_file(pool, &req.file.content_version, &req.file.path)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            not_found(format!(
                "file not found: {}:{}",
                req.file.content_version, req.file.path
            ))
        })?;
    let resolved = registry::resolve_file(pool, file.id, req.snapshot_id)
        .await
        .map_err(classify)?;
    Ok(Json(resolved))
}

// ============ POST /gc ============

async fn handle_gc(State(state): State<AppState>) -> Result<Json<GcResponse>, AppError> {
    let pool = state.engine.pool();
    let artifacts_deleted = artifacts::gc(pool).await.map_err(internal)?;
    let snapshots_pruned = registry::prune(pool, KEEP_SNAPSHOTS)
        .await
        .map_err(internal)?;
    info!(artifacts_deleted, snapshots_pruned, "garbage collected");
    Ok(Json(GcResponse {
        artifacts_deleted,
        snapshots_pruned,
    }))
}

// ============ POST /shutdown ============

async fn handle_shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    info!("shutdown requested over the control plane");
    state.engine.shutdown();
    Json(ShutdownResponse {
        status: "draining".to_string(),
    })
}

// ============ GET /status ============

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let engine = &state.engine;
    let status = status::collect_status(
        engine.pool(),
        engine.session_id(),
        state.started_at.elapsed().as_secs(),
        state.workers,
        engine.steps().invocations(),
    )
    .await
    .map_err(internal)?;
    Ok(Json(status))
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    let config = engine.config();
    let reachable = db::ping(engine.pool()).await;
    let failed = if reachable {
        queue::counts(engine.pool())
            .await
            .ok()
            .and_then(|c| c.get("failed").copied())
            .unwrap_or(0)
    } else {
        0
    };

    Json(HealthResponse {
        status: if reachable { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: config.db.path.display().to_string(),
        store_reachable: reachable,
        lock: lock::read_holder(&config.lock_path()),
        failed,
    })
}
