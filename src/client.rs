//! HTTP client for a running daemon's control plane.
//!
//! The address is taken from the writer-lock file when a live daemon holds
//! the lock (it records the port it actually bound), and from
//! `[daemon].bind` otherwise.

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::error::ClientError;
use crate::lock;
use crate::protocol::*;
use crate::queue::Summary;
use crate::registry::{Resolution, ResolvedReference, Snapshot};

/// Headroom on top of a server-side wait before the request itself times out.
const WAIT_SLACK: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct ControlClient {
    http: Client,
    base: String,
    name: String,
}

impl ControlClient {
    pub fn new(addr: &str, name: &str) -> Result<Self, ClientError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            http,
            base: format!("http://{}", addr),
            name: name.to_string(),
        })
    }

    /// Client for the daemon serving `config`'s store.
    pub fn for_config(config: &Config, name: &str) -> Result<Self, ClientError> {
        Self::new(&control_addr(config), name)
    }

    /// Connect only if a daemon currently holds the writer lock and answers.
    pub async fn connect_running(config: &Config, name: &str) -> Option<Self> {
        if !lock::is_held(&config.lock_path()) {
            return None;
        }
        let client = Self::for_config(config, name).ok()?;
        client.health().await.ok()?;
        Some(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn enqueue_files(&self, files: Vec<FileRef>, priority: i64) -> Result<Vec<i64>, ClientError> {
        let resp: EnqueueResponse = self
            .post("/enqueue_files", &EnqueueFilesRequest { files, priority }, None)
            .await?;
        Ok(resp.queue_ids)
    }

    pub async fn enqueue_scan(&self, req: &EnqueueScanRequest) -> Result<EnqueueScanResponse, ClientError> {
        self.post("/enqueue_scan", req, None).await
    }

    pub async fn await_idle(&self, timeout: Duration, queue_ids: Option<Vec<i64>>) -> Result<Summary, ClientError> {
        let req = AwaitIdleRequest {
            timeout_ms: timeout.as_millis() as u64,
            queue_ids,
        };
        self.post("/await_idle", &req, Some(timeout + WAIT_SLACK)).await
    }

    pub async fn wait(&self, queue_ids: Vec<i64>, timeout: Duration) -> Result<WaitResponse, ClientError> {
        let req = WaitRequest {
            queue_ids,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.post("/wait", &req, Some(timeout + WAIT_SLACK)).await
    }

    pub async fn cancel(&self, queue_ids: Vec<i64>) -> Result<u64, ClientError> {
        let resp: CancelResponse = self
            .post("/cancel", &CancelRequest { queue_ids }, None)
            .await?;
        Ok(resp.cancelled)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ClientError> {
        self.post("/registry/snapshot", &serde_json::json!({}), None).await
    }

    pub async fn resolve(&self, name: &str, snapshot_id: Option<i64>) -> Result<Resolution, ClientError> {
        let req = ResolveRequest {
            name: name.to_string(),
            snapshot_id,
        };
        self.post("/registry/resolve", &req, None).await
    }

    pub async fn resolve_file(&self, file: FileRef, snapshot_id: Option<i64>) -> Result<Vec<ResolvedReference>, ClientError> {
        let req = ResolveFileRequest { file, snapshot_id };
        self.post("/registry/resolve_file", &req, None).await
    }

    pub async fn gc(&self) -> Result<GcResponse, ClientError> {
        self.post("/gc", &serde_json::json!({}), None).await
    }

    pub async fn shutdown(&self) -> Result<ShutdownResponse, ClientError> {
        self.post("/shutdown", &serde_json::json!({}), None).await
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        self.send(self.http.get(self.url("/status"))).await
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.send(self.http.get(self.url("/health"))).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, ClientError> {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        self.send(req).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = req.header(CLIENT_HEADER, &self.name).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
                Ok(env) => ClientError::Remote {
                    code: env.error.code,
                    message: env.error.message,
                },
                Err(_) => ClientError::Remote {
                    code: status.as_u16().to_string(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                },
            });
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::Transport(format!("malformed response: {}", e)))
    }
}

/// Address of the daemon for `config`: the one recorded by the live lock
/// holder, falling back to the configured bind address.
pub fn control_addr(config: &Config) -> String {
    let lock_path = config.lock_path();
    if lock::is_held(&lock_path) {
        if let Some(addr) = lock::read_holder(&lock_path).and_then(|h| h.control_addr) {
            return addr;
        }
    }
    config.daemon.bind.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_daemon_is_a_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ControlClient::new(&addr, "test").unwrap();
        let err = client.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
