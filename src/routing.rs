//! Routing table: file-name patterns → envelopes.
//!
//! The table is a versioned TOML file:
//!
//! ```toml
//! version = 1
//!
//! [envelopes]
//! script = ["ingest", "parse", "extract-definitions", "extract-references"]
//! table = ["ingest", "parse-table", "extract-definitions"]
//!
//! [[routes]]
//! pattern = "common/**/*.txt"
//! envelope = "script"
//!
//! [[routes]]
//! pattern = "**/*.csv"
//! envelope = "table"
//! ```
//!
//! Routes are tried in file order and the first match wins. Unmatched files
//! get the empty [`SKIP_ENVELOPE`]. The assignment is made once, at
//! discovery, and the resulting step list is written to the store.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobMatcher};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

pub const SKIP_ENVELOPE: &str = "skip";

#[derive(Debug, Deserialize)]
struct RoutingFile {
    version: i64,
    #[serde(default)]
    envelopes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    pattern: String,
    envelope: String,
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub version: i64,
    /// SHA-256 of the routing file bytes; a change forces a full rescan.
    pub hash: String,
    envelopes: BTreeMap<String, Vec<String>>,
    routes: Vec<(GlobMatcher, String)>,
}

impl RoutingTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read routing table: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: RoutingFile =
            toml::from_str(content).with_context(|| "Failed to parse routing table")?;

        let mut envelopes = file.envelopes;
        match envelopes.get(SKIP_ENVELOPE) {
            Some(steps) if !steps.is_empty() => {
                bail!("the '{}' envelope must not list steps", SKIP_ENVELOPE)
            }
            _ => {
                envelopes.insert(SKIP_ENVELOPE.to_string(), Vec::new());
            }
        }

        let mut routes = Vec::with_capacity(file.routes.len());
        for route in file.routes {
            if !envelopes.contains_key(&route.envelope) {
                bail!(
                    "route '{}' names unknown envelope '{}'",
                    route.pattern,
                    route.envelope
                );
            }
            let matcher = Glob::new(&route.pattern)
                .with_context(|| format!("invalid route pattern '{}'", route.pattern))?
                .compile_matcher();
            routes.push((matcher, route.envelope));
        }

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());

        Ok(Self {
            version: file.version,
            hash: format!("{:x}", hasher.finalize()),
            envelopes,
            routes,
        })
    }

    /// Envelope name for a path relative to its content-version root.
    pub fn envelope_for(&self, relative_path: &str) -> &str {
        self.routes
            .iter()
            .find(|(matcher, _)| matcher.is_match(relative_path))
            .map(|(_, envelope)| envelope.as_str())
            .unwrap_or(SKIP_ENVELOPE)
    }

    pub fn steps(&self, envelope: &str) -> Option<&[String]> {
        self.envelopes.get(envelope).map(|s| s.as_slice())
    }

    pub fn envelopes(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.envelopes.iter()
    }

    /// Every step name referenced by any envelope.
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut steps: Vec<&str> = self
            .envelopes
            .values()
            .flat_map(|s| s.iter().map(|x| x.as_str()))
            .collect();
        steps.sort_unstable();
        steps.dedup();
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
version = 3

[envelopes]
script = ["ingest", "parse", "extract-definitions"]
table = ["ingest", "parse-table"]

[[routes]]
pattern = "gfx/**"
envelope = "skip"

[[routes]]
pattern = "**/*.txt"
envelope = "script"

[[routes]]
pattern = "**/*.csv"
envelope = "table"
"#;

    #[test]
    fn first_match_wins() {
        let table = RoutingTable::parse(TABLE).unwrap();
        assert_eq!(table.version, 3);
        assert_eq!(table.envelope_for("common/traits/a.txt"), "script");
        assert_eq!(table.envelope_for("gfx/readme.txt"), "skip");
        assert_eq!(table.envelope_for("history/names.csv"), "table");
    }

    #[test]
    fn unmatched_files_skip() {
        let table = RoutingTable::parse(TABLE).unwrap();
        assert_eq!(table.envelope_for("music/theme.ogg"), SKIP_ENVELOPE);
        assert_eq!(table.steps(SKIP_ENVELOPE), Some(&[][..]));
    }

    #[test]
    fn unknown_envelope_is_rejected() {
        let err = RoutingTable::parse(
            r#"
version = 1
[[routes]]
pattern = "*.txt"
envelope = "nope"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown envelope"));
    }

    #[test]
    fn hash_tracks_content() {
        let a = RoutingTable::parse(TABLE).unwrap();
        let b = RoutingTable::parse(&TABLE.replace("version = 3", "version = 4")).unwrap();
        assert_ne!(a.hash, b.hash);
        assert_eq!(
            a.referenced_steps(),
            vec!["extract-definitions", "ingest", "parse", "parse-table"]
        );
    }
}
