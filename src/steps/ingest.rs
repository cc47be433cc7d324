use async_trait::async_trait;
use serde_json::json;

use super::{Step, StepInput, StepOutput};
use crate::error::StepError;
use crate::signature::content_hash;

/// Reads the file, checks it still matches the recorded content hash and
/// hands the decoded text downstream.
pub struct Ingest;

#[async_trait]
impl Step for Ingest {
    fn name(&self) -> &str {
        "ingest"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn consumes(&self) -> Option<&[&str]> {
        Some(&[])
    }

    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let bytes = tokio::fs::read(input.path).await?;

        let actual = content_hash(&bytes);
        if actual != input.file.content_hash {
            // Artifacts are filed under the recorded hash and must be
            // derived from exactly those bytes.
            return Err(StepError::Transient(format!(
                "{} changed on disk since it was last hashed",
                input.file.relative_path
            )));
        }

        let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
        let text = std::str::from_utf8(body).map_err(|e| {
            StepError::Derivation(format!("{} is not valid UTF-8: {}", input.file.relative_path, e))
        })?;

        Ok(StepOutput::payload(json!({
            "bytes": bytes.len(),
            "text": text,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileRecord;
    use tempfile::TempDir;

    fn record(path: &str, hash: String) -> FileRecord {
        FileRecord {
            id: 1,
            content_version_id: 1,
            relative_path: path.to_string(),
            content_hash: hash,
            size: 0,
            mtime: 0,
            envelope: "script".to_string(),
        }
    }

    #[tokio::test]
    async fn strips_bom_and_returns_text() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        let bytes = b"\xEF\xBB\xBFkey = value\n";
        std::fs::write(&path, bytes).unwrap();

        let file = record("a.txt", content_hash(bytes));
        let out = Ingest
            .run(StepInput {
                file: &file,
                path: &path,
                upstream: None,
            })
            .await
            .unwrap();
        assert_eq!(out.payload["text"], "key = value\n");
        assert_eq!(out.payload["bytes"], bytes.len());
    }

    #[tokio::test]
    async fn hash_mismatch_is_transient() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "new bytes").unwrap();

        let file = record("a.txt", content_hash(b"old bytes"));
        let err = Ingest
            .run(StepInput {
                file: &file,
                path: &path,
                upstream: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_derivation_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        let bytes = b"caf\xE9";
        std::fs::write(&path, bytes).unwrap();

        let file = record("a.txt", content_hash(bytes));
        let err = Ingest
            .run(StepInput {
                file: &file,
                path: &path,
                upstream: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "derivation");
    }
}
