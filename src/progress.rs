//! Build progress reporting.
//!
//! `strata build` reports what it is scanning and how much of the queue is
//! left while it waits. Progress goes to **stderr** so stdout stays
//! parseable for scripts.

use std::io::Write;

use crate::queue::Summary;

/// A single progress event for a build.
#[derive(Clone, Debug)]
pub enum BuildProgressEvent {
    /// Discovery is walking content versions. Total unknown.
    Discovering,
    /// Items are being processed: `done` finished out of `total` enqueued.
    Building {
        done: u64,
        total: u64,
        failed: u64,
    },
}

impl BuildProgressEvent {
    /// Progress over the items a build enqueued.
    pub fn from_summary(summary: &Summary, total: usize) -> Self {
        let done = summary.built + summary.reused + summary.scanned + summary.failed + summary.cancelled;
        BuildProgressEvent::Building {
            done: done.max(0) as u64,
            total: total as u64,
            failed: summary.failed.max(0) as u64,
        }
    }
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "build  1,234 / 5,000 items (2 failed)".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Discovering => "build  discovering...\n".to_string(),
            BuildProgressEvent::Building { done, total, failed } => {
                let mut line = format!(
                    "build  {} / {} items",
                    format_number(*done),
                    format_number(*total)
                );
                if *failed > 0 {
                    line.push_str(&format!(" ({} failed)", format_number(*failed)));
                }
                line.push('\n');
                line
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Discovering => serde_json::json!({
                "event": "progress",
                "phase": "discovering"
            }),
            BuildProgressEvent::Building { done, total, failed } => serde_json::json!({
                "event": "progress",
                "phase": "building",
                "done": done,
                "total": total,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
