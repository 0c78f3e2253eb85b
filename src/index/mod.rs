//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait stores chunk embeddings in named collections
//! and answers k-nearest-neighbour queries by cosine similarity. A
//! collection is bound to exactly one embedding model: the first upsert
//! fixes the model and dimensionality, and any later write with a
//! different model fails with [`Error::ModelMismatch`].
//!
//! Implementations:
//! - [`InMemoryVectorIndex`]: `parking_lot::RwLock` over hash maps, for tests and one-shot runs.
//! - [`SqliteVectorIndex`]: `sqlx` tables with vectors stored as little-endian f32 BLOBs.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
}

/// One embedded chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub metadata: ChunkMetadata,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Abstract vector store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace vectors by chunk id |
/// | [`query`](VectorIndex::query) | Top-k cosine search, optionally limited to some documents |
/// | [`collection_model`](VectorIndex::collection_model) | Model bound to a collection |
/// | [`prune_document`](VectorIndex::prune_document) | Drop a document's vectors not in a keep set |
/// | [`count`](VectorIndex::count) | Number of vectors in a collection |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records. Last write wins per chunk id.
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()>;

    /// Top `k` chunks by descending cosine similarity; ties break by
    /// ascending chunk id.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        allowed_documents: Option<&HashSet<String>>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn collection_model(&self, collection: &str) -> Result<Option<String>>;

    /// Remove vectors of `document_id` whose chunk id is not in `keep`.
    /// Returns the number removed.
    async fn prune_document(
        &self,
        collection: &str,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<usize>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Check a batch against the collection binding `(model, dims)`.
///
/// Returns the binding the batch implies when the collection is new.
pub(crate) fn check_binding(
    existing: Option<(&str, usize)>,
    records: &[VectorRecord],
) -> Result<Option<(String, usize)>> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    let (model, dims) = match existing {
        Some((m, d)) => (m.to_string(), d),
        None => (first.model.clone(), first.vector.len()),
    };
    for record in records {
        if record.model != model {
            return Err(Error::ModelMismatch {
                expected: model,
                actual: record.model.clone(),
            });
        }
        if record.vector.len() != dims {
            return Err(Error::storage(format!(
                "vector for chunk {} has {} dimensions, collection uses {}",
                record.chunk_id,
                record.vector.len(),
                dims
            )));
        }
    }
    Ok(Some((model, dims)))
}

/// Sort by descending score then ascending chunk id, keep the top `k`.
pub(crate) fn rank(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}
