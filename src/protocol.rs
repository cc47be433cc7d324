//! Request and response bodies of the control plane.
//!
//! Shared by the axum handlers in [`crate::server`] and the HTTP client in
//! [`crate::client`], so both sides agree on field names. Errors are not
//! listed here; they always travel as `{"error": {"code", "message"}}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::discovery::DiscoveryReport;
use crate::lock::LockHolder;
use crate::models::priority;
use crate::queue::{FailureInfo, ItemStatus, LeaseInfo, Summary};
use crate::registry::Snapshot;

/// Header carrying a free-form client name, logged by the daemon.
pub const CLIENT_HEADER: &str = "x-strata-client";

/// A file named by content version and root-relative path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub content_version: String,
    pub path: String,
}

impl FileRef {
    /// Parse the CLI form `content_version:relative/path`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (cv, path) = spec.split_once(':')?;
        if cv.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            content_version: cv.to_string(),
            path: path.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueFilesRequest {
    pub files: Vec<FileRef>,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    priority::NORMAL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub queue_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueScanRequest {
    /// Empty means every configured content version.
    #[serde(default)]
    pub content_versions: Vec<String>,
    #[serde(default)]
    pub force: bool,
    /// Queue scan items for the workers instead of scanning inline.
    #[serde(default)]
    pub defer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueScanResponse {
    pub queue_ids: Vec<i64>,
    /// Present for inline scans.
    #[serde(default)]
    pub report: Option<DiscoveryReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitIdleRequest {
    pub timeout_ms: u64,
    #[serde(default)]
    pub queue_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub queue_ids: Vec<i64>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub items: Vec<ItemStatus>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub queue_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub name: String,
    #[serde(default)]
    pub snapshot_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveFileRequest {
    pub file: FileRef,
    #[serde(default)]
    pub snapshot_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcResponse {
    pub artifacts_deleted: u64,
    pub snapshots_pruned: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub watermark: i64,
    pub latest: Option<Snapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub session_id: String,
    pub uptime_secs: u64,
    pub workers: usize,
    /// Queue depth by status.
    pub queue: BTreeMap<String, i64>,
    pub leases: Vec<LeaseInfo>,
    pub last_error: Option<FailureInfo>,
    pub failures: Vec<FailureInfo>,
    /// Step executions since the daemon started.
    pub invocations: BTreeMap<String, u64>,
    pub registry: RegistryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub store_reachable: bool,
    pub lock: Option<LockHolder>,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub status: String,
}
