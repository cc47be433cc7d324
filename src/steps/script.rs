//! Built-in `parse` step: a brace-structured `key = value` script syntax.
//!
//! ```text
//! # comment
//! @base_cost = 100
//! brave = {
//!     category = personality
//!     opposites = { craven }
//!     cost = @base_cost
//!     name = "Brave"
//! }
//! ```
//!
//! Entries are `key <op> value` where `<op>` is one of `=`, `==`, `!=`,
//! `?=`, `<`, `<=`, `>`, `>=`, or a bare value (list element). Values are
//! bare words, quoted strings or `{ ... }` blocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Step, StepInput, StepOutput};
use crate::error::StepError;

/// Deepest block nesting accepted. Each level costs three levels of JSON in
/// the stored tree, which must stay under serde_json's recursion limit
/// (128) to be read back by downstream steps.
const MAX_DEPTH: usize = 32;

/// One entry of a parsed script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    pub line: i64,
    pub value: NodeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NodeValue {
    Word(String),
    Quoted(String),
    Block(Vec<Node>),
}

pub struct ParseScript;

#[async_trait]
impl Step for ParseScript {
    fn name(&self) -> &str {
        "parse"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn consumes(&self) -> Option<&[&str]> {
        Some(&["ingest"])
    }

    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let text = input.upstream_text()?;
        let nodes = parse_script(text)
            .map_err(|e| StepError::Derivation(format!("{}: {}", input.file.relative_path, e)))?;
        Ok(StepOutput::payload(tree_payload(nodes)?))
    }
}

fn tree_payload(nodes: Vec<Node>) -> Result<serde_json::Value, StepError> {
    let nodes = serde_json::to_value(nodes).map_err(|e| StepError::Derivation(e.to_string()))?;
    Ok(json!({ "kind": "tree", "nodes": nodes }))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Op(String),
    Word(String),
    Quoted(String),
}

fn tokenize(text: &str) -> Result<Vec<(Token, i64)>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line: i64 = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                chars.next();
                tokens.push((Token::Open, line));
            }
            '}' => {
                chars.next();
                tokens.push((Token::Close, line));
            }
            '"' => {
                let start = line;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        '\n' => {
                            line += 1;
                            s.push(c);
                        }
                        _ => s.push(c),
                    }
                }
                if !closed {
                    return Err(format!("unterminated string starting at line {}", start));
                }
                tokens.push((Token::Quoted(s), start));
            }
            '=' | '<' | '>' | '!' | '?' => {
                chars.next();
                let mut op = c.to_string();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    op.push('=');
                }
                match op.as_str() {
                    "=" | "==" | "!=" | "?=" | "<" | "<=" | ">" | ">=" => {
                        tokens.push((Token::Op(op), line))
                    }
                    _ => return Err(format!("stray '{}' at line {}", op, line)),
                }
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "{}=<>!?\"#".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((Token::Word(word), line));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, i64)>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<(Token, i64)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    /// Parse entries until the matching `}` (when `opened_at` is set) or EOF.
    fn entries(&mut self, opened_at: Option<i64>, depth: usize) -> Result<Vec<Node>, String> {
        if depth > MAX_DEPTH {
            return Err(format!("blocks nested deeper than {}", MAX_DEPTH));
        }
        let mut nodes = Vec::new();
        loop {
            let (tok, line) = match self.next() {
                Some(t) => t,
                None => {
                    return match opened_at {
                        Some(open) => Err(format!("unclosed '{{' opened at line {}", open)),
                        None => Ok(nodes),
                    }
                }
            };
            match tok {
                Token::Close => {
                    return match opened_at {
                        Some(_) => Ok(nodes),
                        None => Err(format!("unexpected '}}' at line {}", line)),
                    }
                }
                Token::Open => {
                    let children = self.entries(Some(line), depth + 1)?;
                    nodes.push(Node {
                        key: None,
                        op: None,
                        line,
                        value: NodeValue::Block(children),
                    });
                }
                Token::Op(op) => {
                    return Err(format!("operator '{}' without a key at line {}", op, line));
                }
                Token::Word(key) | Token::Quoted(key) => {
                    if let Some(Token::Op(op)) = self.peek().cloned() {
                        self.pos += 1;
                        let value = match self.next() {
                            Some((Token::Open, open)) => {
                                NodeValue::Block(self.entries(Some(open), depth + 1)?)
                            }
                            Some((Token::Word(w), _)) => NodeValue::Word(w),
                            Some((Token::Quoted(q), _)) => NodeValue::Quoted(q),
                            _ => {
                                return Err(format!(
                                    "expected a value after '{} {}' at line {}",
                                    key, op, line
                                ))
                            }
                        };
                        nodes.push(Node {
                            key: Some(key),
                            op: Some(op),
                            line,
                            value,
                        });
                    } else {
                        nodes.push(Node {
                            key: None,
                            op: None,
                            line,
                            value: NodeValue::Word(key),
                        });
                    }
                }
            }
        }
    }
}

/// Parse script text into a list of top-level nodes.
pub fn parse_script(text: &str) -> Result<Vec<Node>, String> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.entries(None, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_blocks() {
        let text = r#"
# personality traits
@base_cost = 100
brave = {
    category = personality
    opposites = { craven }
    cost = @base_cost
    name = "Brave one"
}
"#;
        let nodes = parse_script(text).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].key.as_deref(), Some("@base_cost"));
        assert_eq!(nodes[0].line, 3);

        let brave = &nodes[1];
        assert_eq!(brave.key.as_deref(), Some("brave"));
        assert_eq!(brave.line, 4);
        let NodeValue::Block(children) = &brave.value else {
            panic!("expected block");
        };
        assert_eq!(children.len(), 4);
        assert_eq!(children[1].value, NodeValue::Block(vec![Node {
            key: None,
            op: None,
            line: 6,
            value: NodeValue::Word("craven".to_string()),
        }]));
        assert_eq!(children[3].value, NodeValue::Quoted("Brave one".to_string()));
    }

    #[test]
    fn comparison_operators() {
        let nodes = parse_script("trigger = { age >= 16 gold != 0 has_trait ?= brave }").unwrap();
        let NodeValue::Block(children) = &nodes[0].value else {
            panic!("expected block");
        };
        let ops: Vec<_> = children.iter().map(|n| n.op.clone().unwrap()).collect();
        assert_eq!(ops, vec![">=", "!=", "?="]);
    }

    #[test]
    fn unbalanced_braces_are_errors() {
        let err = parse_script("a = {\n b = c\n").unwrap_err();
        assert!(err.contains("unclosed"), "{}", err);
        assert!(err.contains("line 1"), "{}", err);

        let err = parse_script("a = b\n}").unwrap_err();
        assert!(err.contains("unexpected '}' at line 2"), "{}", err);
    }

    #[test]
    fn missing_value_and_unterminated_string() {
        assert!(parse_script("a = ").unwrap_err().contains("expected a value"));
        assert!(parse_script("a = \"open").unwrap_err().contains("unterminated"));
        assert!(parse_script("= b").unwrap_err().contains("without a key"));
    }

    #[test]
    fn comments_and_empty_input() {
        assert!(parse_script("").unwrap().is_empty());
        assert!(parse_script("# only a comment\n").unwrap().is_empty());
        let nodes = parse_script("a = b # trailing { not a block\n").unwrap();
        assert_eq!(nodes.len(), 1);
    }

    fn nested(levels: usize) -> String {
        let mut text = String::new();
        for i in 0..levels {
            text.push_str(&format!("k{} = {{\n", i));
        }
        text.push_str("leaf = yes\n");
        text.push_str(&"}\n".repeat(levels));
        text
    }

    #[test]
    fn deepest_accepted_tree_reloads_from_storage() {
        let nodes = parse_script(&nested(MAX_DEPTH)).unwrap();
        let stored = tree_payload(nodes).unwrap().to_string();
        let reloaded: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(reloaded["kind"], "tree");

        let err = parse_script(&nested(MAX_DEPTH + 1)).unwrap_err();
        assert!(err.contains("nested deeper"), "{}", err);
    }
}
