//! Core data models used throughout ReportMiner.
//!
//! These types represent the documents, segments, chunks, structured
//! extracts and processing log entries that flow through the ingestion
//! and retrieval pipeline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of accepted input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Xlsx,
    Csv,
    Txt,
}

impl FileType {
    pub const ALL: [FileType; 5] = [
        FileType::Pdf,
        FileType::Docx,
        FileType::Xlsx,
        FileType::Csv,
        FileType::Txt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Xlsx => "xlsx",
            FileType::Csv => "csv",
            FileType::Txt => "txt",
        }
    }

    /// Resolve from a file extension (case-insensitive, leading dot allowed).
    pub fn from_extension(ext: &str) -> Option<FileType> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "xlsx" => Some(FileType::Xlsx),
            "csv" => Some(FileType::Csv),
            "txt" | "text" => Some(FileType::Txt),
            _ => None,
        }
    }

    /// Resolve from a filename's extension.
    pub fn from_filename(filename: &str) -> Option<FileType> {
        std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(FileType::from_extension)
    }

    /// Tabular formats map one row to one segment.
    pub fn is_tabular(&self) -> bool {
        matches!(self, FileType::Xlsx | FileType::Csv)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::from_extension(s).ok_or_else(|| format!("unsupported file type: {}", s))
    }
}

/// Processing state of a document.
///
/// `Pending → Processing → {Completed | Failed | RequiresReview}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RequiresReview,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::RequiresReview => "requires_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::Failed | DocumentStatus::RequiresReview
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            "requires_review" => Ok(DocumentStatus::RequiresReview),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// An uploaded report and its processing state.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub size_bytes: u64,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub chunk_count: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Upload handed to the core by the upload collaborator.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub file_type: FileType,
    pub bytes: Vec<u8>,
}

/// Structural role of a text segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Heading,
    Title,
    Paragraph,
    ListItem,
    TableCaption,
    TableRow,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Heading => "heading",
            SegmentKind::Title => "title",
            SegmentKind::Paragraph => "paragraph",
            SegmentKind::ListItem => "list_item",
            SegmentKind::TableCaption => "table_caption",
            SegmentKind::TableRow => "table_row",
        }
    }
}

impl FromStr for SegmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heading" => Ok(SegmentKind::Heading),
            "title" => Ok(SegmentKind::Title),
            "paragraph" => Ok(SegmentKind::Paragraph),
            "list_item" => Ok(SegmentKind::ListItem),
            "table_caption" => Ok(SegmentKind::TableCaption),
            "table_row" => Ok(SegmentKind::TableRow),
            other => Err(format!("unknown segment kind: {}", other)),
        }
    }
}

/// An ordered unit of extracted text.
///
/// `sequence_number` is 1-based and dense within a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextSegment {
    pub document_id: String,
    pub sequence_number: i64,
    pub page_number: Option<u32>,
    pub kind: SegmentKind,
    pub content: String,
    pub content_length: usize,
    pub word_count: usize,
    pub section_title: Option<String>,
}

impl TextSegment {
    pub fn new(
        document_id: &str,
        sequence_number: i64,
        page_number: Option<u32>,
        kind: SegmentKind,
        content: String,
    ) -> Self {
        let section_title = match kind {
            SegmentKind::Heading | SegmentKind::Title => {
                Some(content.chars().take(500).collect())
            }
            _ => None,
        };
        Self {
            document_id: document_id.to_string(),
            sequence_number,
            page_number,
            kind,
            content_length: content.chars().count(),
            word_count: content.split_whitespace().count(),
            content,
            section_title,
        }
    }
}

/// A bounded span of document text prepared for embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    pub first_sequence: i64,
    pub last_sequence: i64,
    pub token_estimate: usize,
}

/// Typed value of a table cell or key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Boolean(bool),
}

impl CellValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Text(_) => "text",
            CellValue::Number(_) => "number",
            CellValue::Integer(_) => "integer",
            CellValue::Date(_) => "date",
            CellValue::DateTime(_) => "datetime",
            CellValue::Boolean(_) => "boolean",
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    pub row: usize,
    pub column: usize,
    pub column_name: Option<String>,
    pub value: CellValue,
    pub raw: String,
    pub confidence: f32,
}

/// A table extracted from a spreadsheet, CSV file or DOCX table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredTable {
    pub id: String,
    pub document_id: String,
    pub name: String,
    pub headers: Vec<String>,
    pub rows: usize,
    pub columns: usize,
    pub cells: Vec<TableCell>,
}

impl StructuredTable {
    /// Column index for a header name (case-insensitive).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name.trim()))
    }

    /// All numeric values of one column, in row order.
    pub fn numeric_column(&self, column: usize) -> Vec<f64> {
        let mut cells: Vec<&TableCell> = self
            .cells
            .iter()
            .filter(|c| c.column == column)
            .collect();
        cells.sort_by_key(|c| c.row);
        cells.iter().filter_map(|c| c.value.as_f64()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub document_id: String,
    pub key: String,
    pub value: CellValue,
    pub raw_value: String,
    pub category: String,
    pub verified: Option<bool>,
    pub confidence: f32,
}

/// Pipeline stages recorded in the processing log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Splitting,
    Embedding,
    Indexing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Splitting => "splitting",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(Stage::Extraction),
            "splitting" => Ok(Stage::Splitting),
            "embedding" => Ok(Stage::Embedding),
            "indexing" => Ok(Stage::Indexing),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    NeedsReview,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::NeedsReview => "needs_review",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            "needs_review" => Ok(StageStatus::NeedsReview),
            other => Err(format!("unknown stage status: {}", other)),
        }
    }
}

/// Append-only record of one pipeline stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingLogEntry {
    pub id: String,
    pub document_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
    pub detail: Option<String>,
}
