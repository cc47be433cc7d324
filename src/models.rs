//! Core data models shared by the store, the workers and the control plane.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Priority tiers. Priority is a plain integer; these are the documented
/// points on the scale.
pub mod priority {
    /// Discovery and bulk rebuilds.
    pub const BULK: i64 = 0;
    /// Explicit client requests with no urgency.
    pub const NORMAL: i64 = 10;
    /// User-triggered edits.
    pub const FLASH: i64 = 100;
}

/// One corpus layer: the base corpus or an overlay.
#[derive(Debug, Clone, Serialize)]
pub struct ContentVersion {
    pub id: i64,
    pub name: String,
    pub root: String,
    pub writable: bool,
    /// Position in the configured layer stack; 0 is the base corpus.
    pub layer: i64,
}

impl ContentVersion {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            root: row.get("root"),
            writable: row.get::<i64, _>("writable") != 0,
            layer: row.get("layer"),
        }
    }
}

/// A source file, identified by `(content_version_id, relative_path)`.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub content_version_id: i64,
    pub relative_path: String,
    pub content_hash: String,
    pub size: i64,
    pub mtime: i64,
    pub envelope: String,
}

impl FileRecord {
    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            content_version_id: row.get("content_version_id"),
            relative_path: row.get("relative_path"),
            content_hash: row.get("content_hash"),
            size: row.get("size"),
            mtime: row.get("mtime"),
            envelope: row.get("envelope"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Leased,
    Done,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Leased,
        QueueStatus::Done,
        QueueStatus::Failed,
        QueueStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Leased => "leased",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Done | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    File,
    Scan,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::File => "file",
            QueueKind::Scan => "scan",
        }
    }
}

/// How a `done` item finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// At least one step executed.
    Built,
    /// Every step's artifact was already valid.
    Reused,
    /// A scan request ran discovery.
    Scanned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Built => "built",
            Outcome::Reused => "reused",
            Outcome::Scanned => "scanned",
        }
    }
}

/// One unit of scheduled work.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub kind: QueueKind,
    pub file_id: Option<i64>,
    pub content_version_id: Option<i64>,
    pub priority: i64,
    pub sequence: i64,
    pub status: QueueStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub attempt_count: i64,
    pub outcome: Option<String>,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn from_row(row: &SqliteRow) -> Self {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        Self {
            id: row.get("id"),
            kind: if kind == "scan" {
                QueueKind::Scan
            } else {
                QueueKind::File
            },
            file_id: row.get("file_id"),
            content_version_id: row.get("content_version_id"),
            priority: row.get("priority"),
            sequence: row.get("sequence"),
            status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Failed),
            lease_owner: row.get("lease_owner"),
            lease_expires_at: row.get("lease_expires_at"),
            attempt_count: row.get("attempt_count"),
            outcome: row.get("outcome"),
            last_error_kind: row.get("last_error_kind"),
            last_error: row.get("last_error"),
        }
    }
}

/// A definition local to one file, as emitted by an extraction step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub kind: String,
    pub line: i64,
}

/// A reference local to one file. Never resolved during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub context: String,
    pub line: i64,
}

/// A persisted derived artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub signature: String,
    pub step: String,
    pub content_hash: String,
    pub tool_version: String,
    pub upstream_signature: Option<String>,
    pub payload: serde_json::Value,
}

/// A defining location inside a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub content_version: String,
    pub layer: i64,
    pub relative_path: String,
    pub kind: String,
    pub line: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for st in QueueStatus::ALL {
            assert_eq!(QueueStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(QueueStatus::parse("bogus"), None);
    }

    #[test]
    fn flash_outranks_everything() {
        assert!(priority::FLASH > priority::NORMAL);
        assert!(priority::NORMAL > priority::BULK);
    }
}
