//! `strata status` and `strata health`.
//!
//! With a daemon running both ask it over the control plane. Without one,
//! `status` reads the store directly (read-only) so a crashed or stopped
//! store can still be inspected.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::client::ControlClient;
use crate::config::Config;
use crate::db;
use crate::lock;
use crate::migrate;
use crate::progress::format_number;
use crate::protocol::{HealthResponse, RegistryStatus, StatusResponse};
use crate::queue;
use crate::registry;

/// Gather everything `status` reports from the store.
pub async fn collect_status(
    pool: &SqlitePool,
    session_id: &str,
    uptime_secs: u64,
    workers: usize,
    invocations: BTreeMap<String, u64>,
) -> Result<StatusResponse> {
    let failures = queue::recent_failures(pool, 10).await?;
    Ok(StatusResponse {
        session_id: session_id.to_string(),
        uptime_secs,
        workers,
        queue: queue::counts(pool).await?,
        leases: queue::leases(pool).await?,
        last_error: failures.first().cloned(),
        failures,
        invocations,
        registry: RegistryStatus {
            watermark: registry::watermark(pool).await?,
            latest: registry::latest(pool).await?,
        },
    })
}

pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    if let Some(client) = ControlClient::connect_running(config, "cli:status").await {
        let status = client.status().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print_status(config, &status, true);
        }
        return Ok(());
    }

    if !config.db.path.exists() {
        bail!(
            "no store at {}; run `strata start` or `strata build` first",
            config.db.path.display()
        );
    }
    let pool = db::connect_readonly(config).await?;
    migrate::check_schema(&pool).await?;
    let last_run: Option<String> =
        sqlx::query_scalar("SELECT id FROM runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&pool)
            .await?;
    let status = collect_status(
        &pool,
        last_run.as_deref().unwrap_or("-"),
        0,
        0,
        BTreeMap::new(),
    )
    .await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(config, &status, false);
    }
    Ok(())
}

fn print_status(config: &Config, status: &StatusResponse, running: bool) {
    println!("Strata — Build Status");
    println!("=====================");
    println!();
    println!("  Store:       {}", config.db.path.display());
    if running {
        println!("  Daemon:      running (session {})", status.session_id);
        println!("  Uptime:      {}", format_duration(status.uptime_secs));
        println!("  Workers:     {}", status.workers);
    } else {
        println!("  Daemon:      not running (last run {})", status.session_id);
    }
    println!();

    println!("  Queue:");
    for (st, n) in &status.queue {
        println!("    {:<12} {:>10}", st, format_number(*n as u64));
    }

    if !status.leases.is_empty() {
        println!();
        println!("  Leases:");
        println!("    {:<8} {:<40} {}", "ID", "OWNER", "PATH");
        for l in &status.leases {
            println!(
                "    {:<8} {:<40} {}",
                l.queue_id,
                l.owner,
                l.path.as_deref().unwrap_or("(scan)")
            );
        }
    }

    if !status.invocations.is_empty() {
        println!();
        println!("  Step invocations:");
        for (step, n) in &status.invocations {
            println!("    {:<24} {:>8}", step, format_number(*n));
        }
    }

    println!();
    match &status.registry.latest {
        Some(s) => println!(
            "  Registry:    snapshot {} ({} definitions, watermark {}/{}, built {})",
            s.id,
            format_number(s.definition_count as u64),
            s.watermark,
            status.registry.watermark,
            format_ts_relative(s.created_at)
        ),
        None => println!(
            "  Registry:    no snapshot (watermark {})",
            status.registry.watermark
        ),
    }

    if !status.failures.is_empty() {
        println!();
        println!("  Recent failures:");
        for f in &status.failures {
            println!(
                "    #{:<6} {:<32} {:<20} {} (attempt {}): {}",
                f.queue_id,
                f.path.as_deref().unwrap_or("-"),
                f.step,
                f.kind,
                f.attempt,
                f.message
            );
        }
    }
    println!();
}

pub async fn run_health(config: &Config, json: bool) -> Result<()> {
    let health = match ControlClient::connect_running(config, "cli:health").await {
        Some(client) => client.health().await?,
        None => {
            let holder = lock::read_holder(&config.lock_path()).filter(|_| lock::is_held(&config.lock_path()));
            match holder {
                Some(h) => bail!(
                    "writer lock held by pid {} but its control plane does not answer",
                    h.pid
                ),
                None => bail!("no daemon is running for {}", config.db.path.display()),
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        print_health(&health);
    }
    if !health.store_reachable {
        bail!("store {} is not reachable", health.store);
    }
    Ok(())
}

fn print_health(health: &HealthResponse) {
    println!("status:    {}", health.status);
    println!("version:   {}", health.version);
    println!("store:     {} ({})", health.store, if health.store_reachable { "reachable" } else { "unreachable" });
    if let Some(h) = &health.lock {
        println!("lock:      pid {} since {}", h.pid, h.acquired_at);
        if let Some(addr) = &h.control_addr {
            println!("control:   http://{}", addr);
        }
    }
    println!("failed:    {}", health.failed);
}

fn format_duration(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
