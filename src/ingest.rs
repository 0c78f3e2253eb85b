//! Ingestion orchestration.
//!
//! Drives one document through `extraction → splitting → embedding →
//! indexing` and records the outcome:
//!
//! ```text
//! pending ──begin_processing──▶ processing ──▶ completed
//!                                         ├──▶ failed
//!                                         └──▶ requires_review
//! ```
//!
//! Entering `processing` is an atomic compare-and-set, so a re-delivered or
//! concurrent `ingest` for the same document is skipped without touching
//! anything. A claim older than `ingest.processing_lease_secs` is taken
//! over, so a document whose worker died is not stuck in `processing`. Stage failures become a processing-log entry plus a terminal
//! status; only repository failures are returned as `Err`.
//!
//! Re-running a document (after [`Ingestor::reprocess`]) is idempotent:
//! extraction and splitting are pure, chunk ids are deterministic, the
//! index upserts by chunk id, and vectors of chunks that no longer exist
//! are pruned.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunk;
use crate::config::{ChunkingConfig, Config};
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::extract::{self, Extraction};
use crate::index::{ChunkMetadata, VectorIndex, VectorRecord};
use crate::models::{
    Chunk, Document, DocumentStatus, FileType, NewDocument, ProcessingLogEntry, Stage,
    StageStatus,
};
use crate::store::{DocumentMetrics, Repository};

/// Result of one `ingest` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Completed {
        chunk_count: usize,
        total_tokens: usize,
    },
    Failed {
        stage: Stage,
        error: String,
    },
    /// Valid input that produced no text.
    NeedsReview { reason: String },
    /// The document was not pending; nothing was done.
    Skipped { status: DocumentStatus },
}

/// Selection for a batch re-process.
#[derive(Debug, Clone)]
pub struct ReprocessFilter {
    pub status: DocumentStatus,
    pub file_type: Option<FileType>,
    pub limit: usize,
}

pub struct Ingestor {
    repo: Arc<dyn Repository>,
    index: Arc<dyn VectorIndex>,
    embeddings: EmbeddingClient,
    chunking: ChunkingConfig,
    collection: String,
    max_file_bytes: u64,
    processing_lease: chrono::Duration,
}

/// Timing of a stage in progress.
struct StageRun {
    stage: Stage,
    started_at: DateTime<Utc>,
}

impl StageRun {
    fn start(stage: Stage) -> Self {
        Self {
            stage,
            started_at: Utc::now(),
        }
    }

    fn entry(
        &self,
        document_id: &str,
        status: StageStatus,
        error: Option<String>,
        detail: Option<String>,
    ) -> ProcessingLogEntry {
        ProcessingLogEntry {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            stage: self.stage,
            status,
            started_at: self.started_at,
            completed_at: Utc::now(),
            error,
            detail,
        }
    }
}

impl Ingestor {
    pub fn new(
        repo: Arc<dyn Repository>,
        index: Arc<dyn VectorIndex>,
        embeddings: EmbeddingClient,
        config: &Config,
    ) -> Self {
        Self {
            repo,
            index,
            embeddings,
            chunking: config.chunking.clone(),
            collection: config.retrieval.collection.clone(),
            max_file_bytes: config.ingest.max_file_bytes,
            processing_lease: chrono::Duration::seconds(
                config.ingest.processing_lease_secs.min(i64::MAX as u64 / 1000) as i64,
            ),
        }
    }

    /// Claims started at or before this instant belong to dead workers.
    fn stale_before(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_sub_signed(self.processing_lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Store an upload as a `pending` document.
    pub async fn register(&self, new: NewDocument) -> Result<Document> {
        let doc = self.repo.register(new).await?;
        info!(
            document_id = %doc.id,
            filename = %doc.filename,
            file_type = %doc.file_type,
            size_bytes = doc.size_bytes,
            "registered document"
        );
        Ok(doc)
    }

    /// Operator re-process: move a terminal document, or one whose
    /// processing claim outlived `ingest.processing_lease_secs`, back to
    /// `pending`.
    ///
    /// Returns `false` when the document is pending or still being processed.
    pub async fn reprocess(&self, document_id: &str) -> Result<bool> {
        let doc = self
            .repo
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
        let reset = self
            .repo
            .reset_to_pending(document_id, self.stale_before())
            .await?;
        if reset {
            info!(document_id, previous = %doc.status, "document reset to pending");
        }
        Ok(reset)
    }

    /// Make `doc` ready for [`ingest`](Self::ingest): `pending` documents
    /// already are, anything else goes through [`reprocess`](Self::reprocess).
    pub async fn requeue(&self, doc: &Document) -> Result<bool> {
        if doc.status == DocumentStatus::Pending {
            return Ok(true);
        }
        self.reprocess(&doc.id).await
    }

    /// Documents matching `filter`, newest first.
    pub async fn select(&self, filter: &ReprocessFilter) -> Result<Vec<Document>> {
        let docs = self
            .repo
            .list_documents(Some(filter.status), usize::MAX)
            .await?;
        Ok(docs
            .into_iter()
            .filter(|d| filter.file_type.map_or(true, |t| d.file_type == t))
            .take(filter.limit)
            .collect())
    }

    /// Requeue every document matching `filter` and return the ids now
    /// waiting for [`ingest`](Self::ingest). Documents still held by a live
    /// worker are left alone.
    pub async fn requeue_matching(&self, filter: &ReprocessFilter) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        for doc in self.select(filter).await? {
            if self.requeue(&doc).await? {
                ready.push(doc.id);
            } else {
                warn!(document_id = %doc.id, status = %doc.status, "not requeued");
            }
        }
        Ok(ready)
    }

    /// Run the pipeline for one document.
    pub async fn ingest(&self, document_id: &str) -> Result<IngestOutcome> {
        let doc = self
            .repo
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;

        if !self
            .repo
            .begin_processing(document_id, self.stale_before())
            .await?
        {
            let status = self
                .repo
                .get_document(document_id)
                .await?
                .map(|d| d.status)
                .unwrap_or(doc.status);
            info!(document_id, status = %status, "skipping document that is not pending");
            return Ok(IngestOutcome::Skipped { status });
        }
        if doc.status == DocumentStatus::Processing {
            warn!(document_id, "reclaimed a document abandoned mid-processing");
        }

        match self.run_stages(&doc).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(document_id, error = %err, "ingestion aborted by a storage failure");
                if let Err(mark_err) = self
                    .repo
                    .finish_processing(
                        document_id,
                        DocumentStatus::Failed,
                        Some(err.to_string()),
                        None,
                    )
                    .await
                {
                    error!(document_id, error = %mark_err, "could not mark document as failed");
                }
                Err(err)
            }
        }
    }

    /// Ingest several documents in parallel, at most `concurrency` at a time.
    ///
    /// Results come back in input order.
    pub async fn ingest_many(
        self: &Arc<Self>,
        ids: Vec<String>,
        concurrency: usize,
    ) -> Vec<(String, Result<IngestOutcome>)> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let ingestor = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::storage("ingestion queue closed"))?;
                    ingestor.ingest(&task_id).await
                });
                (id, handle)
            })
            .collect();

        let (ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        ids.into_iter()
            .zip(join_all(handles).await)
            .map(|(id, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(Error::storage(format!("ingestion task failed: {}", e)))
                });
                (id, result)
            })
            .collect()
    }

    async fn run_stages(&self, doc: &Document) -> Result<IngestOutcome> {
        let id = doc.id.as_str();

        // Extraction
        let run = StageRun::start(Stage::Extraction);
        let extraction = match self.extract(doc).await? {
            Ok(extraction) => extraction,
            Err(err) => return self.fail(&run, id, err.to_string()).await,
        };
        if extraction.is_empty() {
            let reason = "no text segments extracted".to_string();
            self.repo
                .append_log(&run.entry(id, StageStatus::NeedsReview, None, Some(reason.clone())))
                .await?;
            self.repo
                .finish_processing(
                    id,
                    DocumentStatus::RequiresReview,
                    Some(reason.clone()),
                    None,
                )
                .await?;
            warn!(document_id = id, "no text extracted, routed to review");
            return Ok(IngestOutcome::NeedsReview { reason });
        }
        self.repo.replace_segments(id, &extraction.segments).await?;
        self.repo.replace_tables(id, &extraction.tables).await?;
        self.repo.replace_key_values(id, &extraction.key_values).await?;
        let detail = format!(
            "{} segments, {} tables, {} key/values",
            extraction.segments.len(),
            extraction.tables.len(),
            extraction.key_values.len()
        );
        self.repo
            .append_log(&run.entry(id, StageStatus::Succeeded, None, Some(detail)))
            .await?;

        // Splitting
        let run = StageRun::start(Stage::Splitting);
        let chunks = chunk::split(id, &extraction.segments, &self.chunking);
        if chunks.is_empty() {
            return self.fail(&run, id, "no chunks produced".to_string()).await;
        }
        self.repo.replace_chunks(id, &chunks).await?;
        let total_tokens: usize = chunks.iter().map(|c| c.token_estimate).sum();
        self.repo
            .append_log(&run.entry(
                id,
                StageStatus::Succeeded,
                None,
                Some(format!("{} chunks, ~{} tokens", chunks.len(), total_tokens)),
            ))
            .await?;

        // Embedding
        let run = StageRun::start(Stage::Embedding);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = match self.embeddings.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(err) => return self.fail(&run, id, err.to_string()).await,
        };
        self.repo
            .append_log(&run.entry(
                id,
                StageStatus::Succeeded,
                None,
                Some(format!(
                    "{} vectors from {}",
                    vectors.len(),
                    self.embeddings.model_name()
                )),
            ))
            .await?;

        // Indexing
        let run = StageRun::start(Stage::Indexing);
        let records = self.records(&chunks, vectors);
        if let Err(err) = self.index.upsert(&self.collection, &records).await {
            return self.fail(&run, id, err.to_string()).await;
        }
        let keep: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let pruned = match self.index.prune_document(&self.collection, id, &keep).await {
            Ok(pruned) => pruned,
            Err(err) => return self.fail(&run, id, err.to_string()).await,
        };
        self.repo
            .append_log(&run.entry(
                id,
                StageStatus::Succeeded,
                None,
                Some(format!(
                    "{} vectors upserted into '{}', {} stale removed",
                    records.len(),
                    self.collection,
                    pruned
                )),
            ))
            .await?;

        let metrics = DocumentMetrics {
            chunk_count: chunks.len() as i64,
            total_tokens: total_tokens as i64,
        };
        self.repo
            .finish_processing(id, DocumentStatus::Completed, None, Some(metrics))
            .await?;
        info!(
            document_id = id,
            chunks = chunks.len(),
            total_tokens,
            "document completed"
        );
        Ok(IngestOutcome::Completed {
            chunk_count: chunks.len(),
            total_tokens,
        })
    }

    /// Load the raw bytes and run the extractor on the blocking pool.
    ///
    /// The outer `Result` carries repository failures, the inner one
    /// extraction failures.
    async fn extract(&self, doc: &Document) -> Result<Result<Extraction>> {
        let Some(bytes) = self.repo.raw_bytes(&doc.id).await? else {
            return Ok(Err(Error::extraction(
                doc.file_type,
                "raw bytes are missing",
            )));
        };
        let document_id = doc.id.clone();
        let file_type = doc.file_type;
        let max_file_bytes = self.max_file_bytes;
        let joined = tokio::task::spawn_blocking(move || {
            extract::extract(&document_id, file_type, &bytes, max_file_bytes)
        })
        .await;
        Ok(match joined {
            Ok(result) => result,
            Err(e) => Err(Error::extraction(
                file_type,
                format!("extractor task failed: {}", e),
            )),
        })
    }

    fn records(&self, chunks: &[Chunk], vectors: Vec<Vec<f32>>) -> Vec<VectorRecord> {
        let model = self.embeddings.model_name().to_string();
        chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorRecord {
                chunk_id: chunk.id.clone(),
                vector,
                model: model.clone(),
                metadata: ChunkMetadata {
                    document_id: chunk.document_id.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                },
            })
            .collect()
    }

    async fn fail(&self, run: &StageRun, document_id: &str, message: String) -> Result<IngestOutcome> {
        self.repo
            .append_log(&run.entry(document_id, StageStatus::Failed, Some(message.clone()), None))
            .await?;
        self.repo
            .finish_processing(
                document_id,
                DocumentStatus::Failed,
                Some(message.clone()),
                None,
            )
            .await?;
        error!(document_id, stage = %run.stage, error = %message, "stage failed");
        Ok(IngestOutcome::Failed {
            stage: run.stage,
            error: message,
        })
    }
}
