//! In-memory [`Repository`] implementation for tests and one-shot runs.
//!
//! All state sits behind one `parking_lot::RwLock`, so the status
//! compare-and-set is trivially atomic.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Chunk, Document, DocumentStatus, KeyValue, NewDocument, ProcessingLogEntry, StructuredTable,
    TextSegment,
};

use super::{DocumentMetrics, Repository};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    blobs: HashMap<String, Vec<u8>>,
    segments: HashMap<String, Vec<TextSegment>>,
    chunks: HashMap<String, Vec<Chunk>>,
    tables: HashMap<String, Vec<StructuredTable>>,
    key_values: HashMap<String, Vec<KeyValue>>,
    log: Vec<ProcessingLogEntry>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &str) -> Error {
    Error::DocumentNotFound(id.to_string())
}

fn is_stale(doc: &Document, stale_before: DateTime<Utc>) -> bool {
    doc.status == DocumentStatus::Processing
        && doc
            .processing_started_at
            .map(|t| t <= stale_before)
            .unwrap_or(true)
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn register(&self, new: NewDocument) -> Result<Document> {
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            filename: new.filename,
            file_type: new.file_type,
            size_bytes: new.bytes.len() as u64,
            status: DocumentStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            processing_started_at: None,
            processing_completed_at: None,
            chunk_count: None,
            total_tokens: None,
        };
        let mut inner = self.inner.write();
        inner.blobs.insert(doc.id.clone(), new.bytes);
        inner.docs.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.inner.read().docs.get(id).cloned())
    }

    async fn raw_bytes(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().blobs.get(id).cloned())
    }

    async fn list_documents(
        &self,
        status: Option<DocumentStatus>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read();
        let mut docs: Vec<Document> = inner
            .docs
            .values()
            .filter(|d| status.map(|s| d.status == s).unwrap_or(true))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn begin_processing(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write();
        let doc = inner.docs.get_mut(id).ok_or_else(|| not_found(id))?;
        if doc.status != DocumentStatus::Pending && !is_stale(doc, stale_before) {
            return Ok(false);
        }
        doc.status = DocumentStatus::Processing;
        doc.processing_started_at = Some(Utc::now());
        doc.processing_completed_at = None;
        doc.error_message = None;
        Ok(true)
    }

    async fn finish_processing(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<String>,
        metrics: Option<DocumentMetrics>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let doc = inner.docs.get_mut(id).ok_or_else(|| not_found(id))?;
        doc.status = status;
        doc.error_message = error_message;
        doc.processing_completed_at = Some(Utc::now());
        doc.chunk_count = metrics.map(|m| m.chunk_count);
        doc.total_tokens = metrics.map(|m| m.total_tokens);
        Ok(())
    }

    async fn reset_to_pending(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.write();
        let doc = inner.docs.get_mut(id).ok_or_else(|| not_found(id))?;
        if !doc.status.is_terminal() && !is_stale(doc, stale_before) {
            return Ok(false);
        }
        doc.status = DocumentStatus::Pending;
        doc.error_message = None;
        doc.processing_started_at = None;
        doc.processing_completed_at = None;
        Ok(true)
    }

    async fn replace_segments(&self, document_id: &str, segments: &[TextSegment]) -> Result<()> {
        self.inner
            .write()
            .segments
            .insert(document_id.to_string(), segments.to_vec());
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>> {
        Ok(self
            .inner
            .read()
            .segments
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.inner
            .write()
            .chunks
            .insert(document_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .inner
            .read()
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_tables(&self, document_id: &str, tables: &[StructuredTable]) -> Result<()> {
        self.inner
            .write()
            .tables
            .insert(document_id.to_string(), tables.to_vec());
        Ok(())
    }

    async fn tables(&self, document_id: &str) -> Result<Vec<StructuredTable>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_key_values(&self, document_id: &str, key_values: &[KeyValue]) -> Result<()> {
        self.inner
            .write()
            .key_values
            .insert(document_id.to_string(), key_values.to_vec());
        Ok(())
    }

    async fn key_values(&self, document_id: &str) -> Result<Vec<KeyValue>> {
        Ok(self
            .inner
            .read()
            .key_values
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        self.inner.write().log.push(entry.clone());
        Ok(())
    }

    async fn processing_log(&self, document_id: &str) -> Result<Vec<ProcessingLogEntry>> {
        Ok(self
            .inner
            .read()
            .log
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn completed_document_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .inner
            .read()
            .docs
            .values()
            .filter(|d| d.status == DocumentStatus::Completed)
            .map(|d| d.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;
    use std::sync::Arc;

    fn upload() -> NewDocument {
        NewDocument {
            filename: "notes.txt".into(),
            file_type: FileType::Txt,
            bytes: b"hello".to_vec(),
        }
    }

    /// A cutoff no live claim is older than.
    fn long_ago() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn stale_processing_claim_can_be_taken_over() {
        let repo = InMemoryRepository::new();
        let doc = repo.register(upload()).await.unwrap();
        assert!(repo.begin_processing(&doc.id, long_ago()).await.unwrap());
        assert!(!repo.begin_processing(&doc.id, long_ago()).await.unwrap());
        assert!(!repo.reset_to_pending(&doc.id, long_ago()).await.unwrap());

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(repo.begin_processing(&doc.id, later).await.unwrap());
        assert!(repo.reset_to_pending(&doc.id, later).await.unwrap());
        let doc = repo.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn register_stores_pending_document_and_bytes() {
        let repo = InMemoryRepository::new();
        let doc = repo.register(upload()).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.size_bytes, 5);
        assert_eq!(repo.raw_bytes(&doc.id).await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn begin_processing_is_exclusive() {
        let repo = Arc::new(InMemoryRepository::new());
        let doc = repo.register(upload()).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            let id = doc.id.clone();
            handles.push(tokio::spawn(async move { repo.begin_processing(&id, long_ago()).await.unwrap() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn reset_only_from_terminal() {
        let repo = InMemoryRepository::new();
        let doc = repo.register(upload()).await.unwrap();
        assert!(!repo.reset_to_pending(&doc.id, long_ago()).await.unwrap());
        assert!(repo.begin_processing(&doc.id, long_ago()).await.unwrap());
        repo.finish_processing(&doc.id, DocumentStatus::Failed, Some("boom".into()), None)
            .await
            .unwrap();
        assert!(repo.reset_to_pending(&doc.id, long_ago()).await.unwrap());
        let doc = repo.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert!(doc.error_message.is_none());
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.begin_processing("nope", long_ago()).await.unwrap_err();
        assert!(matches!(err, Error::DocumentNotFound(_)));
    }
}
