//! The SQLite repository and vector index against a temporary database.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

use reportminer::config::Config;
use reportminer::index::{ChunkMetadata, SqliteVectorIndex, VectorIndex, VectorRecord};
use reportminer::models::{
    Chunk, DocumentStatus, FileType, NewDocument, ProcessingLogEntry, SegmentKind, Stage,
    StageStatus, TextSegment,
};
use reportminer::store::{DocumentMetrics, Repository, SqliteRepository};
use reportminer::{db, migrate, Error};

async fn pool(tmp: &TempDir) -> SqlitePool {
    let config = Config::with_db_path(tmp.path().join("test.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    pool
}

/// A cutoff no live claim is older than.
fn long_ago() -> DateTime<Utc> {
    Utc::now() - Duration::hours(1)
}

fn upload(name: &str) -> NewDocument {
    NewDocument {
        filename: name.to_string(),
        file_type: FileType::Txt,
        bytes: b"Revenue grew in the north.".to_vec(),
    }
}

fn record(chunk_id: &str, document_id: &str, vector: Vec<f32>, model: &str) -> VectorRecord {
    VectorRecord {
        chunk_id: chunk_id.to_string(),
        vector,
        model: model.to_string(),
        metadata: ChunkMetadata {
            document_id: document_id.to_string(),
            chunk_index: 0,
            text: format!("text of {}", chunk_id),
        },
    }
}

#[tokio::test]
async fn document_lifecycle_round_trips() {
    let tmp = TempDir::new().unwrap();
    let repo = SqliteRepository::new(pool(&tmp).await);

    let doc = repo.register(upload("north.txt")).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);
    assert_eq!(
        repo.raw_bytes(&doc.id).await.unwrap().unwrap(),
        b"Revenue grew in the north."
    );

    assert!(repo.begin_processing(&doc.id, long_ago()).await.unwrap());
    assert!(!repo.begin_processing(&doc.id, long_ago()).await.unwrap());

    repo.finish_processing(
        &doc.id,
        DocumentStatus::Completed,
        None,
        Some(DocumentMetrics {
            chunk_count: 1,
            total_tokens: 7,
        }),
    )
    .await
    .unwrap();

    let stored = repo.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Completed);
    assert_eq!(stored.chunk_count, Some(1));
    assert_eq!(stored.total_tokens, Some(7));
    assert!(stored.processing_completed_at.is_some());

    let completed = repo.completed_document_ids().await.unwrap();
    assert!(completed.contains(&doc.id));

    assert!(repo.reset_to_pending(&doc.id, long_ago()).await.unwrap());
    let listed = repo
        .list_documents(Some(DocumentStatus::Pending), 10)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn stale_processing_claim_is_reclaimed() {
    let tmp = TempDir::new().unwrap();
    let repo = SqliteRepository::new(pool(&tmp).await);
    let doc = repo.register(upload("north.txt")).await.unwrap();

    assert!(repo.begin_processing(&doc.id, long_ago()).await.unwrap());
    assert!(!repo.begin_processing(&doc.id, long_ago()).await.unwrap());
    assert!(!repo.reset_to_pending(&doc.id, long_ago()).await.unwrap());

    let later = Utc::now() + Duration::seconds(1);
    assert!(repo.begin_processing(&doc.id, later).await.unwrap());
    assert!(repo.reset_to_pending(&doc.id, later).await.unwrap());
    let stored = repo.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Pending);
    assert!(stored.processing_started_at.is_none());
}

#[tokio::test]
async fn begin_processing_unknown_document_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let repo = SqliteRepository::new(pool(&tmp).await);
    let err = repo.begin_processing("missing", long_ago()).await.unwrap_err();
    assert!(matches!(err, Error::DocumentNotFound(_)));
}

#[tokio::test]
async fn artifacts_are_replaced_not_appended() {
    let tmp = TempDir::new().unwrap();
    let repo = SqliteRepository::new(pool(&tmp).await);
    let doc = repo.register(upload("north.txt")).await.unwrap();

    let segment = TextSegment::new(
        &doc.id,
        1,
        None,
        SegmentKind::Paragraph,
        "Revenue grew in the north.".to_string(),
    );
    repo.replace_segments(&doc.id, &[segment.clone()]).await.unwrap();
    repo.replace_segments(&doc.id, &[segment]).await.unwrap();
    assert_eq!(repo.segments(&doc.id).await.unwrap().len(), 1);

    let chunk = Chunk {
        id: "chunk-1".into(),
        document_id: doc.id.clone(),
        chunk_index: 0,
        text: "Revenue grew in the north.".into(),
        hash: "h".into(),
        first_sequence: 1,
        last_sequence: 1,
        token_estimate: 7,
    };
    repo.replace_chunks(&doc.id, &[chunk.clone()]).await.unwrap();
    repo.replace_chunks(&doc.id, &[chunk]).await.unwrap();
    let chunks = repo.chunks(&doc.id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].token_estimate, 7);
}

#[tokio::test]
async fn processing_log_keeps_order() {
    let tmp = TempDir::new().unwrap();
    let repo = SqliteRepository::new(pool(&tmp).await);
    let doc = repo.register(upload("north.txt")).await.unwrap();

    for (i, stage) in [Stage::Extraction, Stage::Splitting].into_iter().enumerate() {
        let now = Utc::now();
        repo.append_log(&ProcessingLogEntry {
            id: format!("log-{}", i),
            document_id: doc.id.clone(),
            stage,
            status: StageStatus::Succeeded,
            started_at: now,
            completed_at: now,
            error: None,
            detail: Some(format!("step {}", i)),
        })
        .await
        .unwrap();
    }

    let log = repo.processing_log(&doc.id).await.unwrap();
    let stages: Vec<Stage> = log.iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec![Stage::Extraction, Stage::Splitting]);
    assert_eq!(log[1].detail.as_deref(), Some("step 1"));
}

#[tokio::test]
async fn vector_index_ranks_filters_and_prunes() {
    let tmp = TempDir::new().unwrap();
    let index = SqliteVectorIndex::new(pool(&tmp).await);

    index
        .upsert(
            "global",
            &[
                record("a", "doc-1", vec![1.0, 0.0], "m"),
                record("b", "doc-1", vec![0.6, 0.8], "m"),
                record("c", "doc-2", vec![0.0, 1.0], "m"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(index.collection_model("global").await.unwrap().as_deref(), Some("m"));
    assert_eq!(index.count("global").await.unwrap(), 3);

    let hits = index.query("global", &[1.0, 0.0], 2, None).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let allowed: HashSet<String> = ["doc-2".to_string()].into_iter().collect();
    let hits = index
        .query("global", &[1.0, 0.0], 5, Some(&allowed))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.document_id, "doc-2");

    let keep: HashSet<String> = ["a".to_string()].into_iter().collect();
    let removed = index.prune_document("global", "doc-1", &keep).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(index.count("global").await.unwrap(), 2);
}

#[tokio::test]
async fn vector_index_rejects_other_model() {
    let tmp = TempDir::new().unwrap();
    let index = SqliteVectorIndex::new(pool(&tmp).await);
    index
        .upsert("global", &[record("a", "doc-1", vec![1.0, 0.0], "m")])
        .await
        .unwrap();

    let err = index
        .upsert("global", &[record("b", "doc-1", vec![1.0, 0.0], "other")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelMismatch { .. }));
    assert_eq!(index.count("global").await.unwrap(), 1);
}

#[tokio::test]
async fn upsert_replaces_by_chunk_id() {
    let tmp = TempDir::new().unwrap();
    let index = SqliteVectorIndex::new(pool(&tmp).await);
    index
        .upsert("global", &[record("a", "doc-1", vec![1.0, 0.0], "m")])
        .await
        .unwrap();
    index
        .upsert("global", &[record("a", "doc-1", vec![0.0, 1.0], "m")])
        .await
        .unwrap();
    assert_eq!(index.count("global").await.unwrap(), 1);

    let hits = index.query("global", &[0.0, 1.0], 1, None).await.unwrap();
    assert!((hits[0].score - 1.0).abs() < 1e-6);
}
