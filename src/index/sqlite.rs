//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are stored as little-endian f32 BLOBs in the `vectors` table,
//! keyed by `(collection, chunk_id)`; the collection's model binding lives
//! in `vector_collections`. Queries load the collection and rank by cosine
//! similarity in process.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;

use super::{check_binding, rank, ChunkMetadata, ScoredChunk, VectorIndex, VectorRecord};

#[derive(Clone)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, collection: &str, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock for the whole transaction.
        let first = &records[0];
        sqlx::query(
            "INSERT OR IGNORE INTO vector_collections (name, model, dims, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(&first.model)
        .bind(first.vector.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (model, dims): (String, i64) =
            sqlx::query_as("SELECT model, dims FROM vector_collections WHERE name = ?")
                .bind(collection)
                .fetch_one(&mut *tx)
                .await?;
        check_binding(Some((model.as_str(), dims as usize)), records)?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, chunk_id, document_id, chunk_index, text, model, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(collection)
            .bind(&record.chunk_id)
            .bind(&record.metadata.document_id)
            .bind(record.metadata.chunk_index)
            .bind(&record.metadata.text)
            .bind(&record.model)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        allowed_documents: Option<&HashSet<String>>,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, chunk_index, text, embedding FROM vectors WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let document_id: String = row.get("document_id");
            if let Some(allowed) = allowed_documents {
                if !allowed.contains(&document_id) {
                    continue;
                }
            }
            let blob: Vec<u8> = row.get("embedding");
            hits.push(ScoredChunk {
                chunk_id: row.get("chunk_id"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                metadata: ChunkMetadata {
                    document_id,
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                },
            });
        }
        Ok(rank(hits, k))
    }

    async fn collection_model(&self, collection: &str) -> Result<Option<String>> {
        let model: Option<String> =
            sqlx::query_scalar("SELECT model FROM vector_collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(model)
    }

    async fn prune_document(
        &self,
        collection: &str,
        document_id: &str,
        keep: &HashSet<String>,
    ) -> Result<usize> {
        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT chunk_id FROM vectors WHERE collection = ? AND document_id = ?",
        )
        .bind(collection)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for chunk_id in existing.iter().filter(|id| !keep.contains(*id)) {
            sqlx::query("DELETE FROM vectors WHERE collection = ? AND chunk_id = ?")
                .bind(collection)
                .bind(chunk_id)
                .execute(&self.pool)
                .await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
