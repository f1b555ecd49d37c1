//! Row serialization formats shared by the file, executable and HTTP sources.
//!
//! - `TabSeparated`: one row per line, cells separated by `\t`, `\N` is NULL,
//!   backslash escapes `\t`, `\n` and `\\`.
//! - `JSONEachRow`: one JSON object per line, keyed by column name; missing
//!   columns are NULL.

use std::sync::Arc;

use dictum_core::{AttributeType, DictionaryStructure, Key, KeyModel, Row, SourceError, Value};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::RowStream;

const TSV_NULL: &str = "\\N";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFormat {
    #[default]
    TabSeparated,
    JSONEachRow,
}

impl RowFormat {
    /// Decode one line; blank lines yield `None`.
    pub fn decode_line(
        &self,
        structure: &DictionaryStructure,
        line: &str,
    ) -> Result<Option<Row>, SourceError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let raw = match self {
            Self::TabSeparated => decode_tsv_cells(&structure.column_types(), line)?,
            Self::JSONEachRow => {
                let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
                    .map_err(|e| SourceError::data(format!("invalid JSONEachRow line: {e}")))?;
                decode_json_object(structure, &object)?
            }
        };
        structure.decode_row(raw).map(Some)
    }

    /// Decode a whole payload eagerly.
    pub fn decode_all(
        &self,
        structure: &DictionaryStructure,
        text: &str,
    ) -> Result<Vec<Row>, SourceError> {
        let mut rows = Vec::new();
        for line in text.lines() {
            if let Some(row) = self.decode_line(structure, line)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Decode a payload lazily: a malformed line surfaces as a stream error.
    pub fn decode_stream(&self, structure: Arc<DictionaryStructure>, text: String) -> RowStream {
        let format = *self;
        let lines: Vec<String> = text.lines().map(str::to_owned).collect();
        stream::iter(lines)
            .filter_map(move |line| {
                let decoded = format.decode_line(&structure, &line).transpose();
                futures_util::future::ready(decoded)
            })
            .boxed()
    }

    /// Serialize lookup keys, one per line, in key-column order.
    pub fn encode_keys(&self, model: &KeyModel, keys: &[Key]) -> String {
        let names = model.field_names();
        let mut out = String::new();
        for key in keys {
            let values = key.to_values();
            match self {
                Self::TabSeparated => {
                    let cells: Vec<String> = values.iter().map(encode_tsv_cell).collect();
                    out.push_str(&cells.join("\t"));
                }
                Self::JSONEachRow => {
                    let object: serde_json::Map<String, serde_json::Value> = names
                        .iter()
                        .zip(&values)
                        .map(|(name, value)| (name.to_string(), value.to_json()))
                        .collect();
                    out.push_str(&serde_json::Value::Object(object).to_string());
                }
            }
            out.push('\n');
        }
        out
    }
}

fn decode_tsv_cells(types: &[AttributeType], line: &str) -> Result<Vec<Value>, SourceError> {
    let cells: Vec<&str> = line.split('\t').collect();
    if cells.len() != types.len() {
        return Err(SourceError::data(format!(
            "TabSeparated row has {} cells, expected {}",
            cells.len(),
            types.len()
        )));
    }
    cells
        .into_iter()
        .zip(types)
        .map(|(cell, ty)| {
            if cell == TSV_NULL {
                Ok(Value::Null)
            } else {
                Value::parse(*ty, &unescape_tsv(cell)?)
            }
        })
        .collect()
}

/// Decode a JSON object keyed by column name into column-ordered values.
pub fn decode_json_object(
    structure: &DictionaryStructure,
    object: &serde_json::Map<String, serde_json::Value>,
) -> Result<Vec<Value>, SourceError> {
    structure
        .column_names()
        .into_iter()
        .zip(structure.column_types())
        .map(|(name, ty)| match object.get(name) {
            Some(json) => Value::from_json(ty, json),
            None => Ok(Value::Null),
        })
        .collect()
}

pub fn unescape_tsv(cell: &str) -> Result<String, SourceError> {
    if !cell.contains('\\') {
        return Ok(cell.to_string());
    }
    let mut out = String::with_capacity(cell.len());
    let mut chars = cell.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some(other) => {
                return Err(SourceError::data(format!("unknown escape \\{other} in {cell:?}")))
            }
            None => return Err(SourceError::data(format!("dangling backslash in {cell:?}"))),
        }
    }
    Ok(out)
}

pub fn escape_tsv(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

fn encode_tsv_cell(value: &Value) -> String {
    match value {
        Value::Null => TSV_NULL.to_string(),
        other => escape_tsv(&other.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
