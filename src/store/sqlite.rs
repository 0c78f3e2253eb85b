//! SQLite-backed [`Repository`].
//!
//! Timestamps are stored as Unix milliseconds. Typed cell values, table
//! cells and headers are stored as JSON text. Every `replace_*` runs in a
//! single transaction (delete then insert).

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    CellValue, Chunk, Document, DocumentStatus, FileType, KeyValue, NewDocument,
    ProcessingLogEntry, SegmentKind, Stage, StageStatus, StructuredTable, TableCell, TextSegment,
};

use super::{DocumentMetrics, Repository};

const DOCUMENT_COLUMNS: &str = "id, filename, file_type, size_bytes, status, error_message, \
     created_at, processing_started_at, processing_completed_at, chunk_count, total_tokens";

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n > 0)
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ts(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::storage(format!("invalid timestamp: {}", ms)))
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(Error::Storage)
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let file_type: String = row.get("file_type");
    let status: String = row.get("status");
    let started: Option<i64> = row.get("processing_started_at");
    let completed: Option<i64> = row.get("processing_completed_at");
    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        file_type: parse::<FileType>(&file_type)?,
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        status: parse::<DocumentStatus>(&status)?,
        error_message: row.get("error_message"),
        created_at: from_ts(row.get("created_at"))?,
        processing_started_at: started.map(from_ts).transpose()?,
        processing_completed_at: completed.map(from_ts).transpose()?,
        chunk_count: row.get("chunk_count"),
        total_tokens: row.get("total_tokens"),
    })
}

#[async_trait]
impl Repository for SqliteRepository {
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

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO documents (id, filename, file_type, size_bytes, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(doc.file_type.as_str())
        .bind(doc.size_bytes as i64)
        .bind(doc.status.as_str())
        .bind(ts(doc.created_at))
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO document_blobs (document_id, bytes) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(&new.bytes)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(doc)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn raw_bytes(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT bytes FROM document_blobs WHERE document_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(bytes)
    }

    async fn list_documents(
        &self,
        status: Option<DocumentStatus>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {} FROM documents WHERE status = ? ORDER BY created_at DESC, id ASC LIMIT ?",
                    DOCUMENT_COLUMNS
                ))
                .bind(s.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM documents ORDER BY created_at DESC, id ASC LIMIT ?",
                    DOCUMENT_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_document).collect()
    }

    async fn begin_processing(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'processing', processing_started_at = ?, \
             processing_completed_at = NULL, error_message = NULL \
             WHERE id = ? AND (status = 'pending' \
             OR (status = 'processing' AND processing_started_at <= ?))",
        )
        .bind(ts(Utc::now()))
        .bind(id)
        .bind(ts(stale_before))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        Ok(false)
    }

    async fn finish_processing(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<String>,
        metrics: Option<DocumentMetrics>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, error_message = ?, processing_completed_at = ?, \
             chunk_count = ?, total_tokens = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(ts(Utc::now()))
        .bind(metrics.map(|m| m.chunk_count))
        .bind(metrics.map(|m| m.total_tokens))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn reset_to_pending(&self, id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'pending', error_message = NULL, \
             processing_started_at = NULL, processing_completed_at = NULL \
             WHERE id = ? AND (status IN ('completed', 'failed', 'requires_review') \
             OR (status = 'processing' AND processing_started_at <= ?))",
        )
        .bind(id)
        .bind(ts(stale_before))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        Ok(false)
    }

    async fn replace_segments(&self, document_id: &str, segments: &[TextSegment]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM text_segments WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for s in segments {
            sqlx::query(
                "INSERT INTO text_segments (document_id, sequence_number, page_number, kind, \
                 content, content_length, word_count, section_title) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(s.sequence_number)
            .bind(s.page_number.map(i64::from))
            .bind(s.kind.as_str())
            .bind(&s.content)
            .bind(s.content_length as i64)
            .bind(s.word_count as i64)
            .bind(&s.section_title)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>> {
        let rows = sqlx::query(
            "SELECT sequence_number, page_number, kind, content, content_length, word_count, \
             section_title FROM text_segments WHERE document_id = ? ORDER BY sequence_number",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let page: Option<i64> = row.get("page_number");
                Ok(TextSegment {
                    document_id: document_id.to_string(),
                    sequence_number: row.get("sequence_number"),
                    page_number: page.map(|p| p as u32),
                    kind: parse::<SegmentKind>(&kind)?,
                    content: row.get("content"),
                    content_length: row.get::<i64, _>("content_length") as usize,
                    word_count: row.get::<i64, _>("word_count") as usize,
                    section_title: row.get("section_title"),
                })
            })
            .collect()
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for c in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, text, hash, first_sequence, \
                 last_sequence, token_estimate) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(document_id)
            .bind(c.chunk_index)
            .bind(&c.text)
            .bind(&c.hash)
            .bind(c.first_sequence)
            .bind(c.last_sequence)
            .bind(c.token_estimate as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, chunk_index, text, hash, first_sequence, last_sequence, token_estimate \
             FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Chunk {
                id: row.get("id"),
                document_id: document_id.to_string(),
                chunk_index: row.get("chunk_index"),
                text: row.get("text"),
                hash: row.get("hash"),
                first_sequence: row.get("first_sequence"),
                last_sequence: row.get("last_sequence"),
                token_estimate: row.get::<i64, _>("token_estimate") as usize,
            })
            .collect())
    }

    async fn replace_tables(&self, document_id: &str, tables: &[StructuredTable]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM structured_tables WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for (ordinal, t) in tables.iter().enumerate() {
            sqlx::query(
                "INSERT INTO structured_tables (id, document_id, ordinal, name, headers_json, \
                 row_count, column_count, cells_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&t.id)
            .bind(document_id)
            .bind(ordinal as i64)
            .bind(&t.name)
            .bind(serde_json::to_string(&t.headers)?)
            .bind(t.rows as i64)
            .bind(t.columns as i64)
            .bind(serde_json::to_string(&t.cells)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn tables(&self, document_id: &str) -> Result<Vec<StructuredTable>> {
        let rows = sqlx::query(
            "SELECT id, name, headers_json, row_count, column_count, cells_json \
             FROM structured_tables WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let headers: String = row.get("headers_json");
                let cells: String = row.get("cells_json");
                Ok(StructuredTable {
                    id: row.get("id"),
                    document_id: document_id.to_string(),
                    name: row.get("name"),
                    headers: serde_json::from_str(&headers)?,
                    rows: row.get::<i64, _>("row_count") as usize,
                    columns: row.get::<i64, _>("column_count") as usize,
                    cells: serde_json::from_str::<Vec<TableCell>>(&cells)?,
                })
            })
            .collect()
    }

    async fn replace_key_values(&self, document_id: &str, key_values: &[KeyValue]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM key_values WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for (ordinal, kv) in key_values.iter().enumerate() {
            sqlx::query(
                "INSERT INTO key_values (document_id, ordinal, key, value_json, raw_value, \
                 category, verified, confidence) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(ordinal as i64)
            .bind(&kv.key)
            .bind(serde_json::to_string(&kv.value)?)
            .bind(&kv.raw_value)
            .bind(&kv.category)
            .bind(kv.verified)
            .bind(kv.confidence as f64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn key_values(&self, document_id: &str) -> Result<Vec<KeyValue>> {
        let rows = sqlx::query(
            "SELECT key, value_json, raw_value, category, verified, confidence \
             FROM key_values WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let value: String = row.get("value_json");
                Ok(KeyValue {
                    document_id: document_id.to_string(),
                    key: row.get("key"),
                    value: serde_json::from_str::<CellValue>(&value)?,
                    raw_value: row.get("raw_value"),
                    category: row.get("category"),
                    verified: row.get("verified"),
                    confidence: row.get::<f64, _>("confidence") as f32,
                })
            })
            .collect()
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO processing_log (id, document_id, stage, status, started_at, \
             completed_at, error, detail) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.document_id)
        .bind(entry.stage.as_str())
        .bind(entry.status.as_str())
        .bind(ts(entry.started_at))
        .bind(ts(entry.completed_at))
        .bind(&entry.error)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn processing_log(&self, document_id: &str) -> Result<Vec<ProcessingLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, stage, status, started_at, completed_at, error, detail \
             FROM processing_log WHERE document_id = ? ORDER BY seq",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let stage: String = row.get("stage");
                let status: String = row.get("status");
                Ok(ProcessingLogEntry {
                    id: row.get("id"),
                    document_id: document_id.to_string(),
                    stage: parse::<Stage>(&stage)?,
                    status: parse::<StageStatus>(&status)?,
                    started_at: from_ts(row.get("started_at"))?,
                    completed_at: from_ts(row.get("completed_at"))?,
                    error: row.get("error"),
                    detail: row.get("detail"),
                })
            })
            .collect()
    }

    async fn completed_document_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE status = 'completed'")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }
}
