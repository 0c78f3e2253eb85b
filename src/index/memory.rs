//! In-memory [`VectorIndex`] implementation.
//!
//! Collections live in a `HashMap` behind a `parking_lot::RwLock`. Queries
//! take the read lock only; search is brute-force cosine similarity.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_similarity;
use crate::error::Result;

use super::{check_binding, rank, ScoredChunk, VectorIndex, VectorRecord};

struct Collection {
    model: String,
    dims: usize,
    records: HashMap<String, VectorRecord>,
}

/// In-memory vector index for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored vector for a chunk, if any.
    pub fn get(&self, collection: &str, chunk_id: &str) -> Option<VectorRecord> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.records.get(chunk_id).cloned())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        let mut collections = self.collections.write();
        let existing = collections
            .get(collection)
            .map(|c| (c.model.as_str(), c.dims));
        let Some((model, dims)) = check_binding(existing, records)? else {
            return Ok(());
        };
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                model,
                dims,
                records: HashMap::new(),
            });
        for record in records {
            entry
                .records
                .insert(record.chunk_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        allowed_documents: Option<&HashSet<String>>,
    ) -> Result<Vec<ScoredChunk>> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let hits: Vec<ScoredChunk> = coll
            .records
            .values()
            .filter(|r| {
                allowed_documents
                    .map(|allowed| allowed.contains(&r.metadata.document_id))
                    .unwrap_or(true)
            })
            .map(|r| ScoredChunk {
                chunk_id: r.chunk_id.clone(),
                score: cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn collection_model(&self, collection: &str) -> Result<Option<String>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.model.clone()))
    }

    async fn prune_document(
        &self,
        collection: &str,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<usize> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.records.len();
        coll.records
            .retain(|id, r| r.metadata.document_id != document_id || keep.contains(id));
        Ok(before - coll.records.len())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0))
    }
}
