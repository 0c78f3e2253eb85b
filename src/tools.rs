//! Built-in analytical tools.
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `document_search` | Retrieval-augmented answer with sources |
//! | `find_passages` | Raw similarity hits |
//! | `list_documents` | Recently processed documents |
//! | `document_summary` | Structure and content statistics of one document |
//! | `extract_numbers` | Typed numeric key/values and table cells |
//! | `statistics` | count/sum/mean/median/min/max/stddev over a column or key |
//! | `compare_documents` | Side-by-side metrics and shared keys |
//! | `sentiment` | Lexicon-based polarity of a document or text |
//!
//! Every tool only sees `completed` documents through [`ToolContext`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::SegmentKind;
use crate::traits::{Tool, ToolContext, ToolError};

/// Default categories for `extract_numbers`.
const NUMERIC_CATEGORIES: [&str; 3] = ["numeric", "currency", "percentage"];
const MAX_EXTRACTED_VALUES: usize = 50;
const MAX_LISTED_DOCUMENTS: usize = 100;

/// Every built-in tool, in discovery order.
pub fn builtins() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(DocumentSearchTool),
        Box::new(FindPassagesTool),
        Box::new(ListDocumentsTool),
        Box::new(DocumentSummaryTool),
        Box::new(ExtractNumbersTool),
        Box::new(StatisticsTool),
        Box::new(CompareDocumentsTool),
        Box::new(SentimentTool),
    ]
}

// ============ Parameter helpers ============

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim()),
        _ => Err(ToolError::invalid(format!("{} must not be empty", key))),
    }
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn optional_usize(params: &Value, key: &str, default: usize) -> Result<usize, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .ok_or_else(|| ToolError::invalid(format!("{} must be a positive integer", key))),
    }
}

fn string_list(params: &Value, key: &str) -> Result<Option<Vec<String>>, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| ToolError::invalid(format!("{} must be a list of strings", key)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(ToolError::invalid(format!(
            "{} must be a list of strings",
            key
        ))),
    }
}

// ============ document_search ============

/// Retrieval-augmented answer. This is the Retrieval Engine exposed as a tool.
pub struct DocumentSearchTool;

#[async_trait]
impl Tool for DocumentSearchTool {
    fn name(&self) -> &str {
        "document_search"
    }

    fn description(&self) -> &str {
        "Answer a question from the indexed documents, with source references"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "Natural language question" },
                "top_k": { "type": "integer", "description": "Passages to retrieve" }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let question = required_str(&params, "question")?;
        let top_k = optional_usize(&params, "top_k", ctx.top_k())?;
        let answer = ctx.answer(question, top_k).await?;
        Ok(json!({
            "answer": answer.text,
            "sources": answer.sources,
        }))
    }
}

// ============ find_passages ============

pub struct FindPassagesTool;

#[async_trait]
impl Tool for FindPassagesTool {
    fn name(&self) -> &str {
        "find_passages"
    }

    fn description(&self) -> &str {
        "Find the passages most similar to a query, without generating an answer"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = required_str(&params, "query")?;
        let limit = optional_usize(&params, "limit", ctx.top_k())?;
        let passages = ctx.search(query, limit).await?;
        Ok(json!({ "passages": passages }))
    }
}

// ============ list_documents ============

pub struct ListDocumentsTool;

#[async_trait]
impl Tool for ListDocumentsTool {
    fn name(&self) -> &str {
        "list_documents"
    }

    fn description(&self) -> &str {
        "List recently processed documents"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Number of documents", "default": 10 }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let limit = optional_usize(&params, "limit", 10)?.min(MAX_LISTED_DOCUMENTS);
        let docs = ctx.list_documents(limit).await?;
        let documents: Vec<Value> = docs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "filename": d.filename,
                    "file_type": d.file_type,
                    "size_bytes": d.size_bytes,
                    "created_at": d.created_at.to_rfc3339(),
                    "chunk_count": d.chunk_count,
                })
            })
            .collect();
        Ok(json!({ "documents": documents }))
    }
}

// ============ document_summary ============

pub struct DocumentSummaryTool;

#[async_trait]
impl Tool for DocumentSummaryTool {
    fn name(&self) -> &str {
        "document_summary"
    }

    fn description(&self) -> &str {
        "Describe one document: type, size, sections, tables and extracted fields"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": { "type": "string", "description": "Document UUID" }
            },
            "required": ["document_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let id = required_str(&params, "document_id")?;
        let doc = ctx.document(id).await?;
        let segments = ctx.segments(id).await?;
        let tables = ctx.tables(id).await?;
        let key_values = ctx.key_values(id).await?;

        let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
        for segment in &segments {
            *kinds.entry(segment.kind.as_str()).or_default() += 1;
        }
        let sections: Vec<&str> = segments
            .iter()
            .filter(|s| matches!(s.kind, SegmentKind::Heading | SegmentKind::Title))
            .filter_map(|s| s.section_title.as_deref())
            .take(20)
            .collect();
        let pages = segments.iter().filter_map(|s| s.page_number).max();
        let table_info: Vec<Value> = tables
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "headers": t.headers,
                    "rows": t.rows,
                    "columns": t.columns,
                })
            })
            .collect();

        Ok(json!({
            "id": doc.id,
            "filename": doc.filename,
            "file_type": doc.file_type,
            "size_bytes": doc.size_bytes,
            "created_at": doc.created_at.to_rfc3339(),
            "processing_completed_at": doc.processing_completed_at.map(|t| t.to_rfc3339()),
            "page_count": pages,
            "segment_count": segments.len(),
            "segments_by_kind": kinds,
            "word_count": segments.iter().map(|s| s.word_count).sum::<usize>(),
            "chunk_count": doc.chunk_count,
            "total_tokens": doc.total_tokens,
            "sections": sections,
            "tables": table_info,
            "key_value_count": key_values.len(),
        }))
    }
}

// ============ extract_numbers ============

pub struct ExtractNumbersTool;

#[async_trait]
impl Tool for ExtractNumbersTool {
    fn name(&self) -> &str {
        "extract_numbers"
    }

    fn description(&self) -> &str {
        "Extract numeric values, currencies, percentages and dates from documents"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": { "type": "string", "description": "Document UUID (optional, all documents if omitted)" },
                "categories": {
                    "type": "array",
                    "items": { "type": "string", "enum": ["numeric", "currency", "percentage", "date"] },
                    "default": NUMERIC_CATEGORIES
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let categories = string_list(&params, "categories")?
            .unwrap_or_else(|| NUMERIC_CATEGORIES.iter().map(|c| c.to_string()).collect());
        let document_ids = match optional_str(&params, "document_id") {
            Some(id) => vec![id.to_string()],
            None => ctx
                .list_documents(MAX_LISTED_DOCUMENTS)
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect(),
        };

        let mut values = Vec::new();
        let mut table_values = Vec::new();
        let mut total_values = 0usize;
        let mut total_cells = 0usize;
        for id in &document_ids {
            for kv in ctx.key_values(id).await? {
                if !categories.iter().any(|c| c == &kv.category) {
                    continue;
                }
                total_values += 1;
                if values.len() < MAX_EXTRACTED_VALUES {
                    values.push(json!({
                        "document_id": kv.document_id,
                        "key": kv.key,
                        "value": kv.value,
                        "raw": kv.raw_value,
                        "category": kv.category,
                    }));
                }
            }
            for table in ctx.tables(id).await? {
                for cell in table.cells.iter().filter(|c| c.value.as_f64().is_some()) {
                    total_cells += 1;
                    if table_values.len() < MAX_EXTRACTED_VALUES {
                        table_values.push(json!({
                            "document_id": table.document_id,
                            "table": table.name,
                            "row": cell.row,
                            "column": cell.column_name,
                            "value": cell.value,
                        }));
                    }
                }
            }
        }

        Ok(json!({
            "values": values,
            "table_values": table_values,
            "summary": {
                "key_values": total_values,
                "table_cells": total_cells,
                "total": total_values + total_cells,
            }
        }))
    }
}

// ============ statistics ============

/// Descriptive statistics over a list of numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

/// `None` for an empty input.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let mean = sum / count as f64;
    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    Some(Summary {
        count,
        sum,
        mean,
        median,
        min: sorted[0],
        max: sorted[count - 1],
        stddev: variance.sqrt(),
    })
}

pub struct StatisticsTool;

#[async_trait]
impl Tool for StatisticsTool {
    fn name(&self) -> &str {
        "statistics"
    }

    fn description(&self) -> &str {
        "Compute count, sum, mean, median, min, max and standard deviation of a table column or a numeric field"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": { "type": "string", "description": "Document UUID" },
                "column": { "type": "string", "description": "Table column header" },
                "key": { "type": "string", "description": "Key of extracted key/value pairs (substring match)" }
            },
            "required": ["document_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let id = required_str(&params, "document_id")?;

        let (source, values) = if let Some(column) = optional_str(&params, "column") {
            let tables = ctx.tables(id).await?;
            let (table, index) = tables
                .iter()
                .find_map(|t| t.column_index(column).map(|i| (t, i)))
                .ok_or_else(|| ToolError::invalid(format!("no table column named '{}'", column)))?;
            (
                json!({ "table": table.name, "column": table.headers[index] }),
                table.numeric_column(index),
            )
        } else if let Some(key) = optional_str(&params, "key") {
            let needle = key.to_lowercase();
            let values: Vec<f64> = ctx
                .key_values(id)
                .await?
                .iter()
                .filter(|kv| kv.key.to_lowercase().contains(&needle))
                .filter_map(|kv| kv.value.as_f64())
                .collect();
            (json!({ "key": key }), values)
        } else {
            return Err(ToolError::invalid("either column or key is required"));
        };

        let summary = summarize(&values)
            .ok_or_else(|| ToolError::invalid("no numeric values to summarize"))?;
        Ok(json!({
            "document_id": id,
            "source": source,
            "statistics": summary,
        }))
    }
}

// ============ compare_documents ============

pub struct CompareDocumentsTool;

#[async_trait]
impl Tool for CompareDocumentsTool {
    fn name(&self) -> &str {
        "compare_documents"
    }

    fn description(&self) -> &str {
        "Compare two or more documents: size, structure and shared fields"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 2
                }
            },
            "required": ["document_ids"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let mut ids = string_list(&params, "document_ids")?.unwrap_or_default();
        let mut seen = HashSet::new();
        ids.retain(|id| !id.is_empty() && seen.insert(id.clone()));
        if ids.len() < 2 {
            return Err(ToolError::invalid("document_ids needs at least two documents"));
        }

        let mut documents = Vec::with_capacity(ids.len());
        // key (lowercased) -> document id -> raw value
        let mut fields: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for id in &ids {
            let doc = ctx.document(id).await?;
            let segments = ctx.segments(id).await?;
            let tables = ctx.tables(id).await?;
            let key_values = ctx.key_values(id).await?;
            for kv in &key_values {
                fields
                    .entry(kv.key.to_lowercase())
                    .or_default()
                    .entry(doc.id.clone())
                    .or_insert_with(|| kv.raw_value.clone());
            }
            let text: String = segments
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            documents.push(json!({
                "id": doc.id,
                "filename": doc.filename,
                "file_type": doc.file_type,
                "size_bytes": doc.size_bytes,
                "segment_count": segments.len(),
                "word_count": segments.iter().map(|s| s.word_count).sum::<usize>(),
                "table_count": tables.len(),
                "key_value_count": key_values.len(),
                "sentiment": score_sentiment(&text),
            }));
        }

        let shared: Vec<Value> = fields
            .into_iter()
            .filter(|(_, per_doc)| per_doc.len() >= 2)
            .map(|(key, per_doc)| json!({ "key": key, "values": per_doc }))
            .collect();

        Ok(json!({
            "documents": documents,
            "shared_fields": shared,
        }))
    }
}

// ============ sentiment ============

const POSITIVE_WORDS: &[&str] = &[
    "achieve", "achieved", "beat", "benefit", "best", "better", "boost", "confident", "efficient",
    "exceeded", "excellent", "expand", "expanded", "favorable", "gain", "gains", "good", "great",
    "grew", "grow", "growth", "improve", "improved", "improvement", "increase", "increased",
    "innovative", "opportunity", "optimistic", "outperform", "outperformed", "positive", "profit",
    "profitable", "record", "recovery", "robust", "solid", "stable", "strong", "stronger",
    "success", "successful", "surpassed", "up",
];

const NEGATIVE_WORDS: &[&str] = &[
    "adverse", "bad", "challenge", "challenging", "concern", "concerns", "decline", "declined",
    "decrease", "decreased", "deficit", "delay", "delayed", "difficult", "down", "drop",
    "dropped", "fail", "failed", "failure", "fell", "headwinds", "impairment", "loss", "losses",
    "miss", "missed", "negative", "poor", "problem", "risk", "risks", "shortfall", "slowdown",
    "underperform", "underperformed", "uncertain", "uncertainty", "volatile", "weak", "weaker",
    "worse",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "hardly"];

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z']+").expect("static regex"))
}

/// Polarity of a text from word counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sentiment {
    /// `(positive - negative) / (positive + negative)`, 0 when neither occurs.
    pub score: f64,
    pub label: &'static str,
    pub positive: usize,
    pub negative: usize,
}

/// Lexicon-based polarity. A negation directly before a word flips it.
pub fn score_sentiment(text: &str) -> Sentiment {
    let mut positive = 0usize;
    let mut negative = 0usize;
    let mut negated = false;
    for m in word_re().find_iter(text) {
        let word = m.as_str().to_lowercase();
        if NEGATIONS.contains(&word.as_str()) {
            negated = true;
            continue;
        }
        let polarity = if POSITIVE_WORDS.contains(&word.as_str()) {
            1
        } else if NEGATIVE_WORDS.contains(&word.as_str()) {
            -1
        } else {
            0
        };
        let polarity = if negated { -polarity } else { polarity };
        match polarity {
            1 => positive += 1,
            -1 => negative += 1,
            _ => {}
        }
        negated = false;
    }

    let total = positive + negative;
    let score = if total == 0 {
        0.0
    } else {
        (positive as f64 - negative as f64) / total as f64
    };
    let label = if score > 0.1 {
        "positive"
    } else if score < -0.1 {
        "negative"
    } else {
        "neutral"
    };
    Sentiment {
        score,
        label,
        positive,
        negative,
    }
}

pub struct SentimentTool;

#[async_trait]
impl Tool for SentimentTool {
    fn name(&self) -> &str {
        "sentiment"
    }

    fn description(&self) -> &str {
        "Estimate whether a document or text reads positive, negative or neutral"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_id": { "type": "string", "description": "Document UUID" },
                "text": { "type": "string", "description": "Text to score when no document is given" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        if let Some(id) = optional_str(&params, "document_id") {
            let segments = ctx.segments(id).await?;
            let mut by_section: HashMap<String, String> = HashMap::new();
            let mut order: Vec<String> = Vec::new();
            let mut current = String::from("(untitled)");
            for segment in &segments {
                if let Some(title) = &segment.section_title {
                    current = title.clone();
                    continue;
                }
                if !by_section.contains_key(&current) {
                    order.push(current.clone());
                }
                let text = by_section.entry(current.clone()).or_default();
                text.push(' ');
                text.push_str(&segment.content);
            }
            let full: String = order
                .iter()
                .filter_map(|title| by_section.get(title).map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            let sections: Vec<Value> = order
                .iter()
                .filter_map(|title| {
                    by_section
                        .get(title)
                        .map(|text| json!({ "section": title, "sentiment": score_sentiment(text) }))
                })
                .collect();
            return Ok(json!({
                "document_id": id,
                "sentiment": score_sentiment(&full),
                "sections": sections,
            }));
        }

        let text = required_str(&params, "text")
            .map_err(|_| ToolError::invalid("either document_id or text is required"))?;
        Ok(json!({ "sentiment": score_sentiment(text) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_odd_and_even() {
        let s = summarize(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.sum, 6.0);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.median, 2.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 3.0);

        let s = summarize(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(s.median, 2.5);
        assert!((s.stddev - 1.118_033_988).abs() < 1e-6);
    }

    #[test]
    fn summarize_empty_is_none() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn sentiment_polarity() {
        assert_eq!(score_sentiment("Revenue grew and margins improved").label, "positive");
        assert_eq!(score_sentiment("Sales declined amid weak demand").label, "negative");
        assert_eq!(score_sentiment("The meeting is on Tuesday").label, "neutral");
    }

    #[test]
    fn negation_flips_polarity() {
        let s = score_sentiment("results were not good");
        assert_eq!(s.positive, 0);
        assert_eq!(s.negative, 1);
    }

    #[test]
    fn optional_usize_rejects_zero_and_strings() {
        let params = json!({ "limit": 0, "top_k": "five" });
        assert!(optional_usize(&params, "limit", 3).is_err());
        assert!(optional_usize(&params, "top_k", 3).is_err());
        assert_eq!(optional_usize(&params, "missing", 3).unwrap(), 3);
    }

    #[test]
    fn required_str_rejects_blank() {
        let params = json!({ "query": "   " });
        assert!(matches!(
            required_str(&params, "query"),
            Err(ToolError::Invalid(_))
        ));
    }
}
