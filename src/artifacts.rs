//! Derived artifacts, keyed by signature, and the per-file pointers to them.
//!
//! Artifact rows are content-addressed: two files with identical bytes and
//! the same envelope step compute the same signature and share one row
//! (with one set of definition/reference child rows). Which artifact is
//! current for a given file is recorded separately in `file_steps`.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;

use crate::models::{Artifact, Definition, Reference};
use crate::queue;
use crate::steps::StepOutput;

/// Load an artifact by signature.
pub async fn load(pool: &SqlitePool, signature: &str) -> Result<Option<Artifact>> {
    let row = sqlx::query(
        r#"
        SELECT signature, step, content_hash, tool_version, upstream_signature, payload
        FROM artifacts WHERE signature = ?
        "#,
    )
    .bind(signature)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let payload: String = row.get("payload");
    Ok(Some(Artifact {
        signature: row.get("signature"),
        step: row.get("step"),
        content_hash: row.get("content_hash"),
        tool_version: row.get("tool_version"),
        upstream_signature: row.get("upstream_signature"),
        payload: serde_json::from_str(&payload)?,
    }))
}

/// Whether an artifact is stored under exactly this signature.
pub async fn exists(pool: &SqlitePool, signature: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM artifacts WHERE signature = ?")
        .bind(signature)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Persist a freshly derived artifact, guarded by lease ownership.
///
/// Returns `false` (writing nothing) if `worker` no longer holds the lease
/// on `queue_id`. A row already stored under the same signature is left
/// untouched.
pub async fn persist(
    pool: &SqlitePool,
    queue_id: i64,
    worker: &str,
    artifact: &Artifact,
    output: &StepOutput,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    if !queue::hold_lease(&mut *tx, queue_id, worker).await? {
        return Ok(false);
    }

    insert(&mut *tx, artifact, output).await?;
    tx.commit().await?;
    Ok(true)
}

async fn insert(conn: &mut SqliteConnection, artifact: &Artifact, output: &StepOutput) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO artifacts
            (signature, step, content_hash, tool_version, upstream_signature, payload, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&artifact.signature)
    .bind(&artifact.step)
    .bind(&artifact.content_hash)
    .bind(&artifact.tool_version)
    .bind(&artifact.upstream_signature)
    .bind(artifact.payload.to_string())
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Ok(());
    }

    for def in &output.definitions {
        sqlx::query(
            "INSERT INTO artifact_definitions (artifact_signature, name, kind, line) VALUES (?, ?, ?, ?)",
        )
        .bind(&artifact.signature)
        .bind(&def.name)
        .bind(&def.kind)
        .bind(def.line)
        .execute(&mut *conn)
        .await?;
    }

    for reference in &output.references {
        sqlx::query(
            "INSERT INTO artifact_references (artifact_signature, name, context, line) VALUES (?, ?, ?, ?)",
        )
        .bind(&artifact.signature)
        .bind(&reference.name)
        .bind(&reference.context)
        .bind(reference.line)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Current `step → signature` pointers for a file.
pub async fn pointers(pool: &SqlitePool, file_id: i64) -> Result<BTreeMap<String, String>> {
    let rows = sqlx::query("SELECT step, signature FROM file_steps WHERE file_id = ?")
        .bind(file_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("step"), r.get("signature")))
        .collect())
}

/// Point `(file, step)` at `signature`. Returns whether the pointer moved.
pub(crate) async fn set_pointer(
    conn: &mut SqliteConnection,
    file_id: i64,
    step: &str,
    signature: &str,
) -> Result<bool> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT signature FROM file_steps WHERE file_id = ? AND step = ?")
            .bind(file_id)
            .bind(step)
            .fetch_optional(&mut *conn)
            .await?;
    if current.as_deref() == Some(signature) {
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO file_steps (file_id, step, signature, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(file_id, step) DO UPDATE SET
            signature = excluded.signature,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(file_id)
    .bind(step)
    .bind(signature)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Drop pointers for steps no longer in the file's envelope.
pub(crate) async fn retain_pointers(
    conn: &mut SqliteConnection,
    file_id: i64,
    steps: &[String],
) -> Result<u64> {
    let rows = sqlx::query("SELECT step FROM file_steps WHERE file_id = ?")
        .bind(file_id)
        .fetch_all(&mut *conn)
        .await?;
    let mut removed = 0;
    for row in rows {
        let step: String = row.get("step");
        if !steps.contains(&step) {
            removed += sqlx::query("DELETE FROM file_steps WHERE file_id = ? AND step = ?")
                .bind(file_id)
                .bind(&step)
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }
    }
    Ok(removed)
}

pub async fn definitions(pool: &SqlitePool, signature: &str) -> Result<Vec<Definition>> {
    let rows = sqlx::query(
        "SELECT name, kind, line FROM artifact_definitions WHERE artifact_signature = ? ORDER BY line, name",
    )
    .bind(signature)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| Definition {
            name: r.get("name"),
            kind: r.get("kind"),
            line: r.get("line"),
        })
        .collect())
}

pub async fn references(pool: &SqlitePool, signature: &str) -> Result<Vec<Reference>> {
    let rows = sqlx::query(
        "SELECT name, context, line FROM artifact_references WHERE artifact_signature = ? ORDER BY line, name",
    )
    .bind(signature)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| Reference {
            name: r.get("name"),
            context: r.get("context"),
            line: r.get("line"),
        })
        .collect())
}

/// Total artifact rows, optionally for one step.
pub async fn count(pool: &SqlitePool, step: Option<&str>) -> Result<i64> {
    let n: i64 = match step {
        Some(step) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE step = ?")
                .bind(step)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(n)
}

/// Delete artifacts whose content hash no file references any more.
pub async fn gc(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let orphaned = "SELECT signature FROM artifacts WHERE content_hash NOT IN (SELECT content_hash FROM files)";

    sqlx::query(&format!(
        "DELETE FROM artifact_definitions WHERE artifact_signature IN ({})",
        orphaned
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!(
        "DELETE FROM artifact_references WHERE artifact_signature IN ({})",
        orphaned
    ))
    .execute(&mut *tx)
    .await?;
    let deleted = sqlx::query(
        "DELETE FROM artifacts WHERE content_hash NOT IN (SELECT content_hash FROM files)",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;
    Ok(deleted)
}
