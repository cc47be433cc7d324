//! Build queue and lease manager.
//!
//! Every producer of work (discovery, flash edits, bulk builds, the control
//! plane) goes through [`enqueue_files`] or [`enqueue_scan_item`]; every
//! consumer goes through [`claim`]. Retrieval order is `priority DESC,
//! sequence ASC`.
//!
//! A lease is `(lease_owner, lease_expires_at)` on a `leased` row. Workers
//! renew it while they run; once it expires the row is claimable again and
//! the previous owner's writes are refused by [`owns_lease`]. Timestamps in
//! this table are Unix milliseconds.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::DaemonConfig;
use crate::error::StepError;
use crate::models::{Outcome, QueueItem, QueueKind, QueueStatus};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Retry settings for transient step failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub retry_delay: Duration,
}

impl From<&DaemonConfig> for RetryPolicy {
    fn from(cfg: &DaemonConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
        }
    }
}

/// Enqueue one item per file. A file that already has a pending item keeps
/// it: the item's priority is raised to `max(old, new)` and its id returned.
pub async fn enqueue_files(pool: &SqlitePool, file_ids: &[i64], priority: i64) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(file_ids.len());
    let mut tx = pool.begin().await?;
    for &file_id in file_ids {
        ids.push(enqueue_one(&mut tx, QueueKind::File, file_id, priority).await?);
    }
    tx.commit().await?;
    Ok(ids)
}

/// Enqueue a deferred discovery pass over one content version.
pub async fn enqueue_scan_item(pool: &SqlitePool, content_version_id: i64, priority: i64) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_one(&mut tx, QueueKind::Scan, content_version_id, priority).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_one(
    conn: &mut SqliteConnection,
    kind: QueueKind,
    target: i64,
    priority: i64,
) -> Result<i64> {
    let column = match kind {
        QueueKind::File => "file_id",
        QueueKind::Scan => "content_version_id",
    };
    let now = now_ms();

    // Write first, so the transaction holds the write lock before it reads.
    let existing: Option<i64> = sqlx::query_scalar(&format!(
        r#"
        UPDATE queue_items
        SET priority = MAX(priority, ?), updated_at = ?
        WHERE id = (
            SELECT id FROM queue_items
            WHERE kind = ? AND {column} = ? AND status = 'pending'
            ORDER BY sequence ASC LIMIT 1
        )
        RETURNING id
        "#,
    ))
    .bind(priority)
    .bind(now)
    .bind(kind.as_str())
    .bind(target)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id = sqlx::query(&format!(
        r#"
        INSERT INTO queue_items (kind, {column}, priority, sequence, status, created_at, updated_at)
        VALUES (?, ?, ?, (SELECT COALESCE(MAX(sequence), 0) + 1 FROM queue_items), 'pending', ?, ?)
        "#,
    ))
    .bind(kind.as_str())
    .bind(target)
    .bind(priority)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(id)
}

/// Atomically lease the next claimable item: a `pending` item whose retry
/// delay has elapsed, or a `leased` item whose lease has expired.
pub async fn claim(pool: &SqlitePool, worker: &str, ttl: Duration) -> Result<Option<QueueItem>> {
    let now = now_ms();
    let row = sqlx::query(
        r#"
        UPDATE queue_items
        SET status = 'leased',
            lease_owner = ?1,
            lease_expires_at = ?2,
            updated_at = ?3
        WHERE id = (
            SELECT id FROM queue_items
            WHERE (status = 'pending' AND (not_before IS NULL OR not_before <= ?3))
               OR (status = 'leased' AND lease_expires_at < ?3)
            ORDER BY priority DESC, sequence ASC
            LIMIT 1
        )
        RETURNING *
        "#,
    )
    .bind(worker)
    .bind(now + ttl.as_millis() as i64)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(QueueItem::from_row))
}

/// Extend a lease. Returns `false` if `worker` no longer owns it.
pub async fn renew(pool: &SqlitePool, queue_id: i64, worker: &str, ttl: Duration) -> Result<bool> {
    let now = now_ms();
    let updated = sqlx::query(
        r#"
        UPDATE queue_items SET lease_expires_at = ?, updated_at = ?
        WHERE id = ? AND status = 'leased' AND lease_owner = ?
        "#,
    )
    .bind(now + ttl.as_millis() as i64)
    .bind(now)
    .bind(queue_id)
    .bind(worker)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Whether `worker` still holds the lease on `queue_id`. A cancelled or
/// reclaimed item is no longer owned.
pub async fn owns_lease(conn: &mut SqliteConnection, queue_id: i64, worker: &str) -> Result<bool> {
    let owned: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM queue_items WHERE id = ? AND status = 'leased' AND lease_owner = ?",
    )
    .bind(queue_id)
    .bind(worker)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(owned.is_some())
}

/// Re-assert ownership of a lease with a write. Inside a transaction this
/// takes SQLite's write lock before anything is read, so the transaction
/// never has to upgrade a read snapshot (which fails without waiting on
/// `busy_timeout`). Returns `false` if `worker` no longer owns the lease.
pub(crate) async fn hold_lease(conn: &mut SqliteConnection, queue_id: i64, worker: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE queue_items SET updated_at = ? WHERE id = ? AND status = 'leased' AND lease_owner = ?",
    )
    .bind(now_ms())
    .bind(queue_id)
    .bind(worker)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Enqueue one file inside the caller's transaction.
pub(crate) async fn enqueue_file_in(conn: &mut SqliteConnection, file_id: i64, priority: i64) -> Result<i64> {
    enqueue_one(conn, QueueKind::File, file_id, priority).await
}

/// Set a terminal status on an owned item. Returns `false` (and changes
/// nothing) if the lease was lost.
pub async fn release(
    pool: &SqlitePool,
    queue_id: i64,
    worker: &str,
    status: QueueStatus,
    outcome: Option<Outcome>,
    session_id: &str,
) -> Result<bool> {
    let mut conn = pool.acquire().await?;
    finish(&mut conn, queue_id, worker, status, outcome, session_id).await
}

/// [`release`] on an open connection or transaction.
pub(crate) async fn finish(
    conn: &mut SqliteConnection,
    queue_id: i64,
    worker: &str,
    status: QueueStatus,
    outcome: Option<Outcome>,
    session_id: &str,
) -> Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE queue_items
        SET status = ?, outcome = ?, session_id = ?, lease_expires_at = NULL, updated_at = ?
        WHERE id = ? AND status = 'leased' AND lease_owner = ?
        "#,
    )
    .bind(status.as_str())
    .bind(outcome.map(|o| o.as_str()))
    .bind(session_id)
    .bind(now_ms())
    .bind(queue_id)
    .bind(worker)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Record a step failure on an owned item.
///
/// Transient errors go back to `pending` with a retry delay until the
/// attempt cap is reached; derivation errors fail immediately. Returns the
/// item's new status, or `None` if the lease was lost.
pub async fn fail(
    pool: &SqlitePool,
    item: &QueueItem,
    worker: &str,
    step: &str,
    err: &StepError,
    policy: RetryPolicy,
    session_id: &str,
) -> Result<Option<QueueStatus>> {
    let mut tx = pool.begin().await?;

    if !hold_lease(&mut *tx, item.id, worker).await? {
        return Ok(None);
    }
    let attempts: i64 = sqlx::query_scalar("SELECT attempt_count FROM queue_items WHERE id = ?")
        .bind(item.id)
        .fetch_one(&mut *tx)
        .await?;
    let attempt = attempts + 1;
    let now = now_ms();

    sqlx::query(
        r#"
        INSERT INTO step_failures (queue_item_id, file_id, step, error_kind, message, attempt, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(item.id)
    .bind(item.file_id)
    .bind(step)
    .bind(err.kind())
    .bind(err.message())
    .bind(attempt)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let retry = err.is_transient() && attempt < policy.max_attempts;
    let (status, not_before, session) = if retry {
        (
            QueueStatus::Pending,
            Some(now + policy.retry_delay.as_millis() as i64),
            None,
        )
    } else {
        (QueueStatus::Failed, None, Some(session_id))
    };

    sqlx::query(
        r#"
        UPDATE queue_items
        SET status = ?, attempt_count = ?, not_before = ?,
            lease_owner = NULL, lease_expires_at = NULL,
            last_error_kind = ?, last_error = ?, session_id = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(attempt)
    .bind(not_before)
    .bind(err.kind())
    .bind(format!("{}: {}", step, err.message()))
    .bind(session)
    .bind(now)
    .bind(item.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(status))
}

/// Cancel pending or leased items. A worker holding a cancelled item stops
/// at its next step boundary without a final write.
pub async fn cancel(pool: &SqlitePool, queue_ids: &[i64], session_id: &str) -> Result<u64> {
    let mut cancelled = 0;
    let mut tx = pool.begin().await?;
    for id in queue_ids {
        cancelled += sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'cancelled', lease_expires_at = NULL, session_id = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'leased')
            "#,
        )
        .bind(session_id)
        .bind(now_ms())
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(cancelled)
}

pub async fn get(pool: &SqlitePool, queue_id: i64) -> Result<Option<QueueItem>> {
    let row = sqlx::query("SELECT * FROM queue_items WHERE id = ?")
        .bind(queue_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(QueueItem::from_row))
}

/// Queue depth by status, with every status present.
pub async fn counts(pool: &SqlitePool) -> Result<BTreeMap<String, i64>> {
    let mut counts: BTreeMap<String, i64> = QueueStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM queue_items GROUP BY status")
        .fetch_all(pool)
        .await?;
    for row in rows {
        counts.insert(row.get("status"), row.get("n"));
    }
    Ok(counts)
}

/// No pending or leased work anywhere in the queue.
pub async fn is_idle(pool: &SqlitePool) -> Result<bool> {
    let open: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_items WHERE status IN ('pending', 'leased')",
    )
    .fetch_one(pool)
    .await?;
    Ok(open == 0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub queue_id: i64,
    pub owner: String,
    pub expires_at: i64,
    pub path: Option<String>,
}

pub async fn leases(pool: &SqlitePool) -> Result<Vec<LeaseInfo>> {
    let rows = sqlx::query(
        r#"
        SELECT q.id, q.lease_owner, q.lease_expires_at, f.relative_path
        FROM queue_items q
        LEFT JOIN files f ON f.id = q.file_id
        WHERE q.status = 'leased'
        ORDER BY q.lease_expires_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| LeaseInfo {
            queue_id: r.get("id"),
            owner: r.get::<Option<String>, _>("lease_owner").unwrap_or_default(),
            expires_at: r.get::<Option<i64>, _>("lease_expires_at").unwrap_or(0),
            path: r.get("relative_path"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub queue_id: i64,
    pub path: Option<String>,
    pub step: String,
    pub kind: String,
    pub message: String,
    pub attempt: i64,
}

/// Most recent step failures, newest first.
pub async fn recent_failures(pool: &SqlitePool, limit: i64) -> Result<Vec<FailureInfo>> {
    let rows = sqlx::query(
        r#"
        SELECT s.queue_item_id, f.relative_path, s.step, s.error_kind, s.message, s.attempt
        FROM step_failures s
        LEFT JOIN files f ON f.id = s.file_id
        ORDER BY s.id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| FailureInfo {
            queue_id: r.get("queue_item_id"),
            path: r.get("relative_path"),
            step: r.get("step"),
            kind: r.get("error_kind"),
            message: r.get("message"),
            attempt: r.get("attempt"),
        })
        .collect())
}

/// Completion summary over a set of items.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub built: i64,
    pub reused: i64,
    pub scanned: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub pending: i64,
    pub leased: i64,
    pub idle: bool,
}

impl Summary {
    fn add(&mut self, status: &str, outcome: Option<&str>, n: i64) {
        match (status, outcome) {
            ("done", Some("built")) => self.built += n,
            ("done", Some("reused")) => self.reused += n,
            ("done", Some("scanned")) => self.scanned += n,
            ("failed", _) => self.failed += n,
            ("cancelled", _) => self.cancelled += n,
            ("pending", _) => self.pending += n,
            ("leased", _) => self.leased += n,
            _ => {}
        }
    }
}

/// Summary of specific items; idle once none of them is pending or leased.
pub async fn summarize_ids(pool: &SqlitePool, queue_ids: &[i64]) -> Result<Summary> {
    let mut summary = Summary::default();
    for item in item_statuses(pool, queue_ids).await? {
        summary.add(item.status.as_str(), item.outcome.as_deref(), 1);
    }
    summary.idle = summary.pending == 0 && summary.leased == 0;
    Ok(summary)
}

/// Summary of everything finished in one session, plus the work still
/// outstanding anywhere in the queue.
pub async fn summarize_session(pool: &SqlitePool, session_id: &str) -> Result<Summary> {
    let mut summary = Summary::default();
    let rows = sqlx::query(
        r#"
        SELECT status, outcome, COUNT(*) AS n FROM queue_items
        WHERE session_id = ? OR status IN ('pending', 'leased')
        GROUP BY status, outcome
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    for row in rows {
        let status: String = row.get("status");
        let outcome: Option<String> = row.get("outcome");
        summary.add(&status, outcome.as_deref(), row.get("n"));
    }
    summary.idle = summary.pending == 0 && summary.leased == 0;
    Ok(summary)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStatus {
    pub queue_id: i64,
    pub status: QueueStatus,
    pub outcome: Option<String>,
    pub attempt_count: i64,
    pub last_error: Option<String>,
}

/// Current status of each requested item; unknown ids are omitted.
pub async fn item_statuses(pool: &SqlitePool, queue_ids: &[i64]) -> Result<Vec<ItemStatus>> {
    let mut out = Vec::with_capacity(queue_ids.len());
    for &id in queue_ids {
        if let Some(item) = get(pool, id).await? {
            out.push(ItemStatus {
                queue_id: item.id,
                status: item.status,
                outcome: item.outcome,
                attempt_count: item.attempt_count,
                last_error: item.last_error,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::memory_pool;
    use crate::models::priority;

    const TTL: Duration = Duration::from_secs(60);

    async fn seed_files(pool: &SqlitePool, n: i64) -> Vec<i64> {
        sqlx::query("INSERT INTO content_versions (name, root, created_at) VALUES ('base', '/x', 0)")
            .execute(pool)
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = sqlx::query(
                "INSERT INTO files (content_version_id, relative_path, content_hash, size, mtime, envelope, updated_at) VALUES (1, ?, 'h', 1, 1, 'script', 0)",
            )
            .bind(format!("f{}.txt", i))
            .execute(pool)
            .await
            .unwrap()
            .last_insert_rowid();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn claims_by_priority_then_sequence() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 4).await;
        let mut ids = Vec::new();
        for (file, prio) in files.iter().zip([1, 5, 1, 5]) {
            ids.extend(enqueue_files(&pool, &[*file], prio).await.unwrap());
        }

        let mut claimed = Vec::new();
        while let Some(item) = claim(&pool, "w", TTL).await.unwrap() {
            claimed.push((item.priority, item.id));
        }
        assert_eq!(
            claimed,
            vec![(5, ids[1]), (5, ids[3]), (1, ids[0]), (1, ids[2])]
        );
    }

    #[tokio::test]
    async fn pending_duplicate_is_raised_not_duplicated() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 1).await;
        let a = enqueue_files(&pool, &files, priority::BULK).await.unwrap();
        let b = enqueue_files(&pool, &files, priority::FLASH).await.unwrap();
        assert_eq!(a, b);
        let item = get(&pool, a[0]).await.unwrap().unwrap();
        assert_eq!(item.priority, priority::FLASH);

        // Lower priority never demotes
        enqueue_files(&pool, &files, priority::NORMAL).await.unwrap();
        assert_eq!(get(&pool, a[0]).await.unwrap().unwrap().priority, priority::FLASH);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_old_owner_refused() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 1).await;
        let id = enqueue_files(&pool, &files, priority::NORMAL).await.unwrap()[0];

        let first = claim(&pool, "a", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.id, id);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = claim(&pool, "b", TTL).await.unwrap().unwrap();
        assert_eq!(second.id, id);

        assert!(!renew(&pool, id, "a", TTL).await.unwrap());
        assert!(!release(&pool, id, "a", QueueStatus::Done, Some(Outcome::Built), "s")
            .await
            .unwrap());
        assert!(release(&pool, id, "b", QueueStatus::Done, Some(Outcome::Reused), "s")
            .await
            .unwrap());
        let item = get(&pool, id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Done);
        assert_eq!(item.outcome.as_deref(), Some("reused"));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_the_cap() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 1).await;
        enqueue_files(&pool, &files, priority::NORMAL).await.unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        };
        let err = StepError::Transient("disk busy".into());

        for expected in [QueueStatus::Pending, QueueStatus::Pending, QueueStatus::Failed] {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let item = claim(&pool, "w", TTL).await.unwrap().unwrap();
            let status = fail(&pool, &item, "w", "ingest", &err, policy, "s").await.unwrap();
            assert_eq!(status, Some(expected));
        }

        let item = claim(&pool, "w", TTL).await.unwrap();
        assert!(item.is_none());
        assert_eq!(recent_failures(&pool, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn derivation_failure_is_immediate() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 1).await;
        enqueue_files(&pool, &files, priority::NORMAL).await.unwrap();
        let item = claim(&pool, "w", TTL).await.unwrap().unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        };
        let status = fail(
            &pool,
            &item,
            "w",
            "parse",
            &StepError::Derivation("unexpected '}'".into()),
            policy,
            "s",
        )
        .await
        .unwrap();
        assert_eq!(status, Some(QueueStatus::Failed));

        let item = get(&pool, item.id).await.unwrap().unwrap();
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_error_kind.as_deref(), Some("derivation"));
    }

    #[tokio::test]
    async fn retry_delay_holds_item_back() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 1).await;
        enqueue_files(&pool, &files, priority::NORMAL).await.unwrap();
        let item = claim(&pool, "w", TTL).await.unwrap().unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
        };
        fail(&pool, &item, "w", "ingest", &StepError::Transient("x".into()), policy, "s")
            .await
            .unwrap();
        assert!(claim(&pool, "w", TTL).await.unwrap().is_none());
        assert!(!is_idle(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_pending_and_leased() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 2).await;
        let ids = enqueue_files(&pool, &files, priority::NORMAL).await.unwrap();
        let leased = claim(&pool, "w", TTL).await.unwrap().unwrap();

        assert_eq!(cancel(&pool, &ids, "s").await.unwrap(), 2);
        let mut conn = pool.acquire().await.unwrap();
        assert!(!owns_lease(&mut conn, leased.id, "w").await.unwrap());
        drop(conn);

        let summary = summarize_ids(&pool, &ids).await.unwrap();
        assert_eq!(summary.cancelled, 2);
        assert!(summary.idle);
        assert_eq!(counts(&pool).await.unwrap()["cancelled"], 2);
    }

    #[tokio::test]
    async fn session_summary_counts_outcomes() {
        let pool = memory_pool().await;
        let files = seed_files(&pool, 3).await;
        enqueue_files(&pool, &files, priority::NORMAL).await.unwrap();
        for outcome in [Outcome::Built, Outcome::Reused] {
            let item = claim(&pool, "w", TTL).await.unwrap().unwrap();
            release(&pool, item.id, "w", QueueStatus::Done, Some(outcome), "s1")
                .await
                .unwrap();
        }

        let summary = summarize_session(&pool, "s1").await.unwrap();
        assert_eq!(summary.built, 1);
        assert_eq!(summary.reused, 1);
        assert_eq!(summary.pending, 1);
        assert!(!summary.idle);
    }
}
