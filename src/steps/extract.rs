//! File-local extraction. Nothing here looks outside the file: references
//! are recorded by name only and resolved later against a registry
//! snapshot.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::script::{Node, NodeValue};
use super::{Step, StepInput, StepOutput};
use crate::error::StepError;
use crate::models::{Definition, Reference};

/// Built-in `extract-definitions`: top-level script keys, or the first
/// column of every table row.
pub struct ExtractDefinitions;

#[async_trait]
impl Step for ExtractDefinitions {
    fn name(&self) -> &str {
        "extract-definitions"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn consumes(&self) -> Option<&[&str]> {
        Some(&["parse", "parse-table"])
    }

    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let payload = input.upstream_payload(self.name())?;
        let definitions = match payload.get("kind").and_then(|k| k.as_str()) {
            Some("tree") => tree_definitions(&nodes_of(payload)?),
            Some("table") => table_definitions(payload),
            other => {
                return Err(StepError::Derivation(format!(
                    "extract-definitions cannot read a '{}' artifact",
                    other.unwrap_or("untyped")
                )))
            }
        };

        Ok(StepOutput {
            payload: json!({ "definitions": definitions.len() }),
            definitions,
            references: Vec::new(),
        })
    }
}

/// Built-in `extract-references`: identifier-valued entries inside blocks.
pub struct ExtractReferences;

#[async_trait]
impl Step for ExtractReferences {
    fn name(&self) -> &str {
        "extract-references"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn consumes(&self) -> Option<&[&str]> {
        Some(&["parse"])
    }

    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let payload = input.upstream_payload(self.name())?;
        let nodes = nodes_of(payload)?;

        let mut references = Vec::new();
        for node in &nodes {
            if let NodeValue::Block(children) = &node.value {
                collect_references(children, node.key.as_deref().unwrap_or(""), &mut references);
            }
        }

        Ok(StepOutput {
            payload: json!({ "references": references.len() }),
            definitions: Vec::new(),
            references,
        })
    }
}

fn nodes_of(payload: &Value) -> Result<Vec<Node>, StepError> {
    let nodes = payload
        .get("nodes")
        .cloned()
        .ok_or_else(|| StepError::Derivation("upstream tree has no nodes".to_string()))?;
    serde_json::from_value(nodes).map_err(|e| StepError::Derivation(e.to_string()))
}

fn tree_definitions(nodes: &[Node]) -> Vec<Definition> {
    nodes
        .iter()
        .filter_map(|node| {
            let key = node.key.as_ref()?;
            let kind = match (&node.value, key.starts_with('@')) {
                (_, true) => "variable",
                (NodeValue::Block(_), false) => "block",
                _ => "value",
            };
            Some(Definition {
                name: key.clone(),
                kind: kind.to_string(),
                line: node.line,
            })
        })
        .collect()
}

fn table_definitions(payload: &Value) -> Vec<Definition> {
    payload
        .get("rows")
        .and_then(|r| r.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let name = row.get("cells")?.get(0)?.as_str()?;
                    if name.is_empty() {
                        return None;
                    }
                    Some(Definition {
                        name: name.to_string(),
                        kind: "row".to_string(),
                        line: row.get("line").and_then(|l| l.as_i64()).unwrap_or(0),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn collect_references(nodes: &[Node], context: &str, out: &mut Vec<Reference>) {
    for node in nodes {
        match &node.value {
            NodeValue::Word(word) if is_identifier(word) => out.push(Reference {
                name: word.clone(),
                context: node.key.clone().unwrap_or_else(|| context.to_string()),
                line: node.line,
            }),
            NodeValue::Block(children) => {
                let inner = node.key.as_deref().unwrap_or(context);
                collect_references(children, inner, out);
            }
            _ => {}
        }
    }
}

/// Words that name something: not numbers, not booleans, not dates.
fn is_identifier(word: &str) -> bool {
    let first = match word.chars().next() {
        Some(c) => c,
        None => return false,
    };
    if !(first.is_alphabetic() || first == '_' || first == '@') {
        return false;
    }
    if matches!(word, "yes" | "no" | "true" | "false") {
        return false;
    }
    word.chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | ':' | '@' | '-' | '\''))
}
