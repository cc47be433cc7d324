//! TOML configuration for the build daemon.
//!
//! A single file (`--config`, default `./config/strata.toml`) names the
//! store location, daemon tuning, the routing table and every content
//! version (the base corpus and its overlays).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub content_versions: Vec<ContentVersionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Control plane address. Must be a loopback address; port `0` picks a
    /// free port, which clients then read back from the writer-lock file.
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: default_workers(),
            lease_ttl_secs: default_lease_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_lease_ttl_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_max_attempts() -> i64 {
    3
}
fn default_retry_delay_secs() -> u64 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Rebuild the registry snapshot once this many definition changes
    /// accumulated past the latest snapshot's watermark.
    #[serde(default = "default_rebuild_threshold")]
    pub rebuild_threshold: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold: default_rebuild_threshold(),
        }
    }
}

fn default_rebuild_threshold() -> i64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentVersionConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Config {
    /// Path of the writer-lock file kept next to the store.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .db
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "strata.sqlite".into());
        name.push(".lock");
        self.db.path.with_file_name(name)
    }

    /// Directory holding detached build logs.
    pub fn runs_dir(&self) -> PathBuf {
        self.db
            .path
            .parent()
            .map(|p| p.join("runs"))
            .unwrap_or_else(|| PathBuf::from("runs"))
    }

    pub fn content_version(&self, name: &str) -> Option<&ContentVersionConfig> {
        self.content_versions.iter().find(|cv| cv.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Relative paths are resolved against the config file's directory
    if let Some(base) = path.parent() {
        config.db.path = resolve(base, &config.db.path);
        config.routing.path = resolve(base, &config.routing.path);
        for cv in &mut config.content_versions {
            cv.root = resolve(base, &cv.root);
        }
    }

    validate(&config)?;
    Ok(config)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || base.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.daemon.workers == 0 {
        anyhow::bail!("daemon.workers must be >= 1");
    }
    if config.daemon.lease_ttl_secs == 0 {
        anyhow::bail!("daemon.lease_ttl_secs must be >= 1");
    }
    if config.daemon.max_attempts < 1 {
        anyhow::bail!("daemon.max_attempts must be >= 1");
    }

    let addr: SocketAddr = config
        .daemon
        .bind
        .parse()
        .with_context(|| format!("daemon.bind is not a socket address: {}", config.daemon.bind))?;
    if !addr.ip().is_loopback() {
        anyhow::bail!(
            "daemon.bind must be a loopback address, got '{}'",
            config.daemon.bind
        );
    }

    let mut seen = HashSet::new();
    for cv in &config.content_versions {
        if cv.name.trim().is_empty() {
            anyhow::bail!("content_versions entries must have a non-empty name");
        }
        if !seen.insert(cv.name.as_str()) {
            anyhow::bail!("duplicate content version name: '{}'", cv.name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("strata.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_and_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "data/strata.sqlite"

[routing]
path = "routes.toml"

[[content_versions]]
name = "base"
root = "corpus/base"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.daemon.workers, 4);
        assert_eq!(cfg.daemon.max_attempts, 3);
        assert_eq!(cfg.registry.rebuild_threshold, 50);
        assert_eq!(cfg.db.path, tmp.path().join("data/strata.sqlite"));
        assert_eq!(cfg.content_versions[0].root, tmp.path().join("corpus/base"));
        assert!(!cfg.content_versions[0].writable);
        assert_eq!(
            cfg.lock_path(),
            tmp.path().join("data/strata.sqlite.lock")
        );
    }

    #[test]
    fn rejects_non_loopback_bind() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "s.sqlite"

[daemon]
bind = "0.0.0.0:7420"

[routing]
path = "routes.toml"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn rejects_duplicate_content_versions() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "s.sqlite"

[routing]
path = "routes.toml"

[[content_versions]]
name = "base"
root = "a"

[[content_versions]]
name = "base"
root = "b"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
