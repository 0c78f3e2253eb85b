//! Persistence abstraction for documents and their derived artifacts.
//!
//! The [`Repository`] trait covers every entity the pipeline writes:
//! documents (with raw bytes), text segments, chunks, structured tables,
//! key/value pairs and the append-only processing log. Implementations
//! must be `Send + Sync` and make [`Repository::begin_processing`] an
//! atomic compare-and-set.
//!
//! - [`InMemoryRepository`]: a single `parking_lot::RwLock` over hash maps.
//! - [`SqliteRepository`]: `sqlx` over the tables created by [`crate::migrate`].

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Chunk, Document, DocumentStatus, KeyValue, NewDocument, ProcessingLogEntry, StructuredTable,
    TextSegment,
};

/// Pipeline metrics recorded on a completed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentMetrics {
    pub chunk_count: i64,
    pub total_tokens: i64,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`register`](Repository::register) | Store a new upload as `pending` |
/// | [`begin_processing`](Repository::begin_processing) | CAS `pending`/stale `processing` → `processing` |
/// | [`finish_processing`](Repository::finish_processing) | Record a terminal status |
/// | [`reset_to_pending`](Repository::reset_to_pending) | Operator re-process of a terminal or stale document |
/// | `replace_*` | Replace a document's derived artifacts |
/// | [`append_log`](Repository::append_log) | Append a processing-log entry |
#[async_trait]
pub trait Repository: Send + Sync {
    /// Store a new document with status `pending`.
    async fn register(&self, new: NewDocument) -> Result<Document>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn raw_bytes(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Documents newest first, optionally filtered by status.
    async fn list_documents(
        &self,
        status: Option<DocumentStatus>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Atomically move `pending → processing`.
    ///
    /// A `processing` document whose `processing_started_at` is at or before
    /// `stale_before` is claimed as well; its worker is presumed dead.
    ///
    /// Returns `false` when the document exists but cannot be claimed;
    /// fails with [`Error::DocumentNotFound`](crate::Error::DocumentNotFound)
    /// when it does not exist.
    async fn begin_processing(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool>;

    /// Move a processing document to a terminal status.
    async fn finish_processing(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<String>,
        metrics: Option<DocumentMetrics>,
    ) -> Result<()>;

    /// Move a terminal or stale `processing` document back to `pending`,
    /// clearing its error. Returns `false` for `pending` and live
    /// `processing` documents.
    async fn reset_to_pending(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool>;

    async fn replace_segments(&self, document_id: &str, segments: &[TextSegment]) -> Result<()>;
    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>>;

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;
    async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn replace_tables(&self, document_id: &str, tables: &[StructuredTable]) -> Result<()>;
    async fn tables(&self, document_id: &str) -> Result<Vec<StructuredTable>>;

    async fn replace_key_values(&self, document_id: &str, key_values: &[KeyValue]) -> Result<()>;
    async fn key_values(&self, document_id: &str) -> Result<Vec<KeyValue>>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()>;
    /// Log entries for a document in insertion order.
    async fn processing_log(&self, document_id: &str) -> Result<Vec<ProcessingLogEntry>>;

    /// Ids of documents whose status is `completed`.
    async fn completed_document_ids(&self) -> Result<HashSet<String>>;
}
