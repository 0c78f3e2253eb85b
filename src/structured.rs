//! Structural heuristics over extracted text and table cells.
//!
//! Prose segments are classified by shape (heading, title, list item,
//! caption, paragraph). Table cells and key/value pairs get a typed value
//! with a confidence score. Delimited blocks inside plain text (pipes or
//! tabs) are recognised as tables.

use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use uuid::Uuid;

use crate::models::{CellValue, KeyValue, SegmentKind, StructuredTable, TableCell};

/// Longest text that can still be a heading or title.
const HEADING_MAX_CHARS: usize = 100;
const TITLE_MAX_WORDS: usize = 10;
/// Key names outside this range are treated as prose, not fields.
const KEY_MIN_CHARS: usize = 3;
const KEY_MAX_WORDS: usize = 6;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];

fn numbered_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.?\s+[A-Z]").expect("static regex"))
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z][^.!?]*$").expect("static regex"))
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-•*]|\d+\.?)\s+").expect("static regex"))
}

fn caption_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i:table|figure|chart)\s+\d+").expect("static regex"))
}

fn key_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z][A-Za-z ]*?)\s*[:=]\s*(\S.*?)\s*$").expect("static regex")
    })
}

fn plain_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)$").expect("static regex"))
}

/// At least one cased letter and no lowercase ones.
fn is_all_upper(text: &str) -> bool {
    let mut cased = false;
    for c in text.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

/// Classify a normalized prose segment.
pub fn classify_segment(text: &str) -> SegmentKind {
    let trimmed = text.trim();
    if trimmed.chars().count() < HEADING_MAX_CHARS {
        if is_all_upper(trimmed) || numbered_heading_re().is_match(trimmed) {
            return SegmentKind::Heading;
        }
        if title_re().is_match(trimmed) && trimmed.split_whitespace().count() <= TITLE_MAX_WORDS {
            return SegmentKind::Title;
        }
    }
    if list_item_re().is_match(trimmed) {
        return SegmentKind::ListItem;
    }
    if caption_re().is_match(trimmed) {
        return SegmentKind::TableCaption;
    }
    SegmentKind::Paragraph
}

/// Infer a typed value from raw cell text.
///
/// Returns the value and a confidence: `1.0` for exact parses and text,
/// `0.9` when formatting had to be stripped or for dates, `0.8` for
/// booleans.
pub fn infer_value(raw: &str) -> (CellValue, f32) {
    let value = raw.trim();
    if value.is_empty() {
        return (CellValue::Text(String::new()), 1.0);
    }

    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%' | '€' | '£'))
        .collect();
    if plain_number_re().is_match(&cleaned) {
        let confidence = if cleaned.len() == value.len() { 1.0 } else { 0.9 };
        if cleaned.contains('.') {
            if let Ok(n) = cleaned.parse::<f64>() {
                return (CellValue::Number(n), confidence);
            }
        } else if let Ok(i) = cleaned.parse::<i64>() {
            return (CellValue::Integer(i), confidence);
        } else if let Ok(n) = cleaned.parse::<f64>() {
            return (CellValue::Number(n), confidence);
        }
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return (CellValue::DateTime(dt), 0.9);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return (CellValue::Date(d), 0.9);
        }
    }

    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" => (CellValue::Boolean(true), 0.8),
        "false" | "no" => (CellValue::Boolean(false), 0.8),
        _ => (CellValue::Text(value.to_string()), 1.0),
    }
}

/// Category label for a typed value.
pub fn value_category(raw: &str, value: &CellValue) -> &'static str {
    match value {
        CellValue::Number(_) | CellValue::Integer(_) => {
            if raw.contains(['$', '€', '£']) {
                "currency"
            } else if raw.trim_end().ends_with('%') {
                "percentage"
            } else {
                "numeric"
            }
        }
        CellValue::Date(_) | CellValue::DateTime(_) => "date",
        CellValue::Boolean(_) => "boolean",
        CellValue::Text(_) => "text",
    }
}

/// Mine `Key: Value` and `Key = Value` lines from prose.
pub fn mine_key_values(document_id: &str, text: &str) -> Vec<KeyValue> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(caps) = key_value_re().captures(line) else {
            continue;
        };
        let key = caps[1].trim();
        let raw_value = caps[2].trim();
        if key.chars().count() < KEY_MIN_CHARS
            || key.split_whitespace().count() > KEY_MAX_WORDS
            || raw_value.is_empty()
        {
            continue;
        }
        let (value, confidence) = infer_value(raw_value);
        out.push(KeyValue {
            document_id: document_id.to_string(),
            key: key.to_string(),
            category: value_category(raw_value, &value).to_string(),
            value,
            raw_value: raw_value.to_string(),
            verified: None,
            confidence,
        });
    }
    out
}

/// Header name for a column, falling back to `Column_N`.
pub fn header_name(headers: &[String], column: usize) -> String {
    match headers.get(column) {
        Some(h) if !h.trim().is_empty() => h.trim().to_string(),
        _ => format!("Column_{}", column + 1),
    }
}

/// Render a data row as `"Header: value; Header: value"`, skipping empty cells.
pub fn row_text(headers: &[String], row: &[String]) -> String {
    row.iter()
        .enumerate()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(i, v)| format!("{}: {}", header_name(headers, i), v.trim()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Build a typed table from a header row and raw data rows.
///
/// Data rows are numbered from 1; row 0 is the header. The table id is
/// derived from the document id and the table ordinal so re-extraction
/// produces the same id.
pub fn build_table(
    document_id: &str,
    ordinal: usize,
    name: &str,
    headers: Vec<String>,
    rows: &[Vec<String>],
) -> StructuredTable {
    let columns = rows
        .iter()
        .map(|r| r.len())
        .chain(std::iter::once(headers.len()))
        .max()
        .unwrap_or(0);
    let mut cells = Vec::new();
    for (r, row) in rows.iter().enumerate() {
        for (c, raw) in row.iter().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let (value, confidence) = infer_value(raw);
            cells.push(TableCell {
                row: r + 1,
                column: c,
                column_name: Some(header_name(&headers, c)),
                value,
                raw: raw.trim().to_string(),
                confidence,
            });
        }
    }
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:table:{}", document_id, ordinal).as_bytes(),
    );
    StructuredTable {
        id: id.to_string(),
        document_id: document_id.to_string(),
        name: name.to_string(),
        headers,
        rows: rows.len(),
        columns,
        cells,
    }
}

/// Split a line on pipes or tabs if it looks like a table row.
pub fn split_delimited_row(line: &str) -> Option<Vec<String>> {
    let line = line.trim();
    let delimiter = if line.matches('|').count() >= 2 {
        '|'
    } else if line.matches('\t').count() >= 2 {
        '\t'
    } else {
        return None;
    };
    let cells: Vec<String> = line
        .trim_matches('|')
        .split(delimiter)
        .map(|c| c.trim().to_string())
        .collect();
    // Markdown separator rows like |---|---|
    if cells
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':' | ' ')))
    {
        return Some(Vec::new());
    }
    if cells.len() >= 2 {
        Some(cells)
    } else {
        None
    }
}

/// Parse a block of lines as a delimited table: header plus at least one row.
pub fn parse_delimited_block(lines: &[&str]) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    if lines.len() < 2 {
        return None;
    }
    let mut parsed = Vec::with_capacity(lines.len());
    for line in lines {
        let row = split_delimited_row(line)?;
        if !row.is_empty() {
            parsed.push(row);
        }
    }
    if parsed.len() < 2 {
        return None;
    }
    let headers = parsed.remove(0);
    Some((headers, parsed))
}
