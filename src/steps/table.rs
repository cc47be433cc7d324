use async_trait::async_trait;
use serde_json::json;

use super::{Step, StepInput, StepOutput};
use crate::error::StepError;

/// Built-in `parse-table` step: a delimited data table with a header row.
///
/// The delimiter is `;` when the header contains one, `,` otherwise.
/// Blank lines and lines starting with `#` are ignored; trailing empty
/// cells are dropped.
pub struct ParseTable;

#[async_trait]
impl Step for ParseTable {
    fn name(&self) -> &str {
        "parse-table"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn consumes(&self) -> Option<&[&str]> {
        Some(&["ingest"])
    }

    async fn run(&self, input: StepInput<'_>) -> Result<StepOutput, StepError> {
        let text = input.upstream_text()?;
        let (columns, rows) = parse_table(text)
            .map_err(|e| StepError::Derivation(format!("{}: {}", input.file.relative_path, e)))?;

        let rows: Vec<_> = rows
            .into_iter()
            .map(|(line, cells)| json!({ "line": line, "cells": cells }))
            .collect();

        Ok(StepOutput::payload(json!({
            "kind": "table",
            "columns": columns,
            "rows": rows,
        })))
    }
}

type Row = (i64, Vec<String>);

/// Split table text into its header columns and `(line, cells)` rows.
pub fn parse_table(text: &str) -> Result<(Vec<String>, Vec<Row>), String> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i as i64 + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

    let (_, header) = lines.next().ok_or_else(|| "table has no header row".to_string())?;
    let delimiter = if header.contains(';') { ';' } else { ',' };

    let columns = split_row(header, delimiter);
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        return Err("table header has no columns".to_string());
    }

    let rows = lines
        .map(|(line, l)| (line, split_row(l, delimiter)))
        .filter(|(_, cells)| !cells.is_empty())
        .collect();

    Ok((columns, rows))
}

fn split_row(line: &str, delimiter: char) -> Vec<String> {
    let mut cells: Vec<String> = line.split(delimiter).map(|c| c.trim().to_string()).collect();
    while cells.last().is_some_and(|c| c.is_empty()) {
        cells.pop();
    }
    cells
}
