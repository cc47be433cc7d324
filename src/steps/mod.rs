//! Derivation steps.
//!
//! A [`Step`] turns one file's inputs (its bytes or an upstream artifact)
//! into a derived artifact. Envelopes name steps; the [`StepRegistry`]
//! maps those names to implementations and counts how often each one
//! actually ran.
//!
//! # Built-in steps
//!
//! | Step | Consumes | Produces |
//! |------|----------|----------|
//! | `ingest` | file bytes | UTF-8 text |
//! | `parse` | `ingest` | brace-structured syntax tree |
//! | `parse-table` | `ingest` | delimited table |
//! | `extract-definitions` | `parse` or `parse-table` | file-local definitions |
//! | `extract-references` | `parse` | file-local references |
//!
//! The source grammar is not fixed by the daemon: a custom binary can
//! [`register`](StepRegistry::register) its own `parse` (same name, its own
//! version) and every artifact downstream of it is re-derived through the
//! signature chain.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use strata::error::StepError;
//! use strata::steps::{Step, StepInput, StepOutput, StepRegistry};
//!
//! struct LineCount;
//!
//! #[async_trait]
//! impl Step for LineCount {
//!     fn name(&self) -> &str { "line-count" }
//!     fn version(&self) -> &str { "1" }
//!     fn consumes(&self) -> Option<&[&str]> { Some(&["ingest"]) }
//!
//!     async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
//!         let text = input.upstream_text()?;
//!         Ok(StepOutput::payload(serde_json::json!({ "lines": text.lines().count() })))
//!     }
//! }
//!
//! let mut steps = StepRegistry::with_builtins();
//! steps.register(Box::new(LineCount));
//! ```

mod extract;
mod ingest;
mod script;
mod table;

pub use extract::{ExtractDefinitions, ExtractReferences};
pub use ingest::Ingest;
pub use script::{parse_script, Node, NodeValue, ParseScript};
pub use table::{parse_table, ParseTable};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StepError;
use crate::models::{Artifact, Definition, FileRecord, Reference};

/// Everything a step may look at.
pub struct StepInput<'a> {
    pub file: &'a FileRecord,
    /// Absolute path of the file on disk.
    pub path: &'a Path,
    /// Output of the step this one consumes, if any.
    pub upstream: Option<&'a Artifact>,
}

impl StepInput<'_> {
    /// Upstream artifact payload, or a derivation error naming the step.
    pub fn upstream_payload(&self, step: &str) -> Result<&Value, StepError> {
        self.upstream
            .map(|a| &a.payload)
            .ok_or_else(|| StepError::Derivation(format!("{} requires an upstream artifact", step)))
    }

    /// The `text` field produced by `ingest`.
    pub fn upstream_text(&self) -> Result<&str, StepError> {
        self.upstream
            .and_then(|a| a.payload.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| StepError::Derivation("upstream artifact carries no text".to_string()))
    }
}

/// What a step hands back to the engine for persisting.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub payload: Value,
    pub definitions: Vec<Definition>,
    pub references: Vec<Reference>,
}

impl StepOutput {
    pub fn payload(payload: Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }
}

/// One derivation step.
///
/// Implementations must be deterministic for a given input and
/// [`version`](Step::version): the version participates in every
/// signature, so any behavior change must come with a version bump.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in envelopes (e.g. `"parse"`).
    fn name(&self) -> &str;

    /// Tool version. Changing it invalidates this step's artifacts and,
    /// through the upstream signature, everything downstream.
    fn version(&self) -> &str;

    /// Steps this one can take its input from; the nearest earlier match
    /// in the envelope is used. `Some(&[])` means no upstream (the step
    /// reads the file itself); `None` means "whatever step precedes me".
    fn consumes(&self) -> Option<&[&str]> {
        None
    }

    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError>;
}

struct Registered {
    step: Box<dyn Step>,
    invocations: AtomicU64,
}

/// Registry of step implementations, keyed by name.
pub struct StepRegistry {
    steps: Vec<Registered>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Registry pre-loaded with the built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(Ingest));
        registry.register(Box::new(ParseScript));
        registry.register(Box::new(ParseTable));
        registry.register(Box::new(ExtractDefinitions));
        registry.register(Box::new(ExtractReferences));
        registry
    }

    /// Register a step, replacing any step with the same name.
    pub fn register(&mut self, step: Box<dyn Step>) {
        self.steps.retain(|r| r.step.name() != step.name());
        self.steps.push(Registered {
            step,
            invocations: AtomicU64::new(0),
        });
    }

    pub fn find(&self, name: &str) -> Option<&dyn Step> {
        self.steps
            .iter()
            .find(|r| r.step.name() == name)
            .map(|r| r.step.as_ref())
    }

    /// Run a step, counting the invocation.
    pub async fn invoke(&self, name: &str, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let registered = self
            .steps
            .iter()
            .find(|r| r.step.name() == name)
            .ok_or_else(|| StepError::Derivation(format!("unknown step '{}'", name)))?;
        registered.invocations.fetch_add(1, Ordering::Relaxed);
        registered.step.run(input).await
    }

    /// Executions per step since this registry was built.
    pub fn invocations(&self) -> BTreeMap<String, u64> {
        self.steps
            .iter()
            .map(|r| {
                (
                    r.step.name().to_string(),
                    r.invocations.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    pub fn invocation_count(&self, name: &str) -> u64 {
        self.steps
            .iter()
            .find(|r| r.step.name() == name)
            .map(|r| r.invocations.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Step name → tool version, as recorded in the store.
    pub fn tool_versions(&self) -> BTreeMap<String, String> {
        self.steps
            .iter()
            .map(|r| (r.step.name().to_string(), r.step.version().to_string()))
            .collect()
    }

    /// For each step of an envelope, the index of the earlier step it
    /// consumes (if any). Fails if a step is unknown or its input is not
    /// produced earlier in the envelope.
    pub fn plan(&self, steps: &[String]) -> anyhow::Result<Vec<Option<usize>>> {
        let mut plan = Vec::with_capacity(steps.len());
        for (i, name) in steps.iter().enumerate() {
            let step = self
                .find(name)
                .ok_or_else(|| anyhow::anyhow!("envelope names unknown step '{}'", name))?;
            let upstream = match step.consumes() {
                None => i.checked_sub(1),
                Some([]) => None,
                Some(accepted) => {
                    let found = steps[..i]
                        .iter()
                        .rposition(|earlier| accepted.contains(&earlier.as_str()));
                    if found.is_none() {
                        anyhow::bail!(
                            "step '{}' needs one of [{}] earlier in its envelope",
                            name,
                            accepted.join(", ")
                        );
                    }
                    found
                }
            };
            plan.push(upstream);
        }
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
