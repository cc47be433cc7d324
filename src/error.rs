//! Typed errors for the places where callers branch on the kind.
//!
//! Everything else propagates as `anyhow::Error`.

use std::collections::BTreeMap;

/// Failure of a single derivation step for a single file.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// I/O trouble (unreadable file, disk contention). Retried up to the
    /// configured attempt cap.
    #[error("transient: {0}")]
    Transient(String),
    /// The input is malformed for this step. Recorded and never retried.
    #[error("derivation: {0}")]
    Derivation(String),
}

impl StepError {
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Transient(_) => "transient",
            StepError::Derivation(_) => "derivation",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Transient(m) | StepError::Derivation(m) => m,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        StepError::Transient(err.to_string())
    }
}

/// Process-fatal conditions surfaced at daemon startup.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("writer lock {path} is held by another process ({holder}); refusing to start a second writer")]
    LockContention { path: String, holder: String },

    #[error("store schema version {found} does not match this binary ({expected}); run `strata reset --fresh` to rebuild the store")]
    SchemaMismatch { expected: i64, found: i64 },

    #[error("store was built with different step versions ({}); restart with `--accept-tool-versions` to regenerate affected artifacts", describe_versions(.changed))]
    ToolVersionMismatch {
        changed: BTreeMap<String, (String, String)>,
    },

    #[error("control plane must bind a loopback address, got '{0}'")]
    NonLocalBind(String),
}

fn describe_versions(changed: &BTreeMap<String, (String, String)>) -> String {
    changed
        .iter()
        .map(|(step, (stored, running))| format!("{}: {} -> {}", step, stored, running))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors seen by control-plane clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The daemon could not be reached or the exchange broke mid-way.
    #[error("control plane transport error: {0}")]
    Transport(String),
    /// The daemon answered with an error envelope.
    #[error("daemon returned {code}: {message}")]
    Remote { code: String, message: String },
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
