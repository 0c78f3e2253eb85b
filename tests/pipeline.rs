//! End-to-end tests of ingestion, retrieval and the query service over the
//! in-memory backends, a hashing embedder and a scripted answer model.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use reportminer::agent::UNABLE_TO_COMPLETE;
use reportminer::config::Config;
use reportminer::embedding::{Embedder, EmbeddingClient, HashEmbedder, ProviderError};
use reportminer::generation::{ChatMessage, Generator, NO_CONTEXT_NOTICE};
use reportminer::index::{InMemoryVectorIndex, VectorIndex};
use reportminer::ingest::{IngestOutcome, Ingestor};
use reportminer::models::{DocumentStatus, FileType, NewDocument, Stage, StageStatus};
use reportminer::query::{QueryOptions, QueryService};
use reportminer::retrieval::RetrievalEngine;
use reportminer::store::{InMemoryRepository, Repository};
use reportminer::traits::{ToolContext, ToolError, ToolProvider, ToolRegistry, ToolSpec};
use reportminer::Error;

const SALES_CSV: &str = "Region,Revenue,Notes\n\
North,100,Strong growth in enterprise accounts\n\
South,80,Weak demand after price changes\n\
East,120,Record quarter with improved margins\n";

const MEMO_TXT: &str = "QUARTERLY MEMO\n\n\
The board approved the hiring plan for the support team.\n\n\
Office relocation is scheduled for the spring.\n";

// ============ Fakes ============

/// Answer model that replays canned replies, then repeats `fallback`.
struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    fn new(replies: &[&str], fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            fallback: fallback.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn last_prompt(&self) -> String {
        self.calls
            .lock()
            .last()
            .and_then(|m| m.last())
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> reportminer::Result<String> {
        self.calls.lock().push(messages.to_vec());
        Ok(self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Tool channel whose discovery fails.
struct UnreachableTools;

#[async_trait]
impl ToolProvider for UnreachableTools {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        Err(ToolError::Infrastructure("connection refused".into()))
    }

    async fn call_tool(&self, _: &str, _: Value, _: &ToolContext) -> Result<Value, ToolError> {
        Err(ToolError::Infrastructure("connection refused".into()))
    }
}

/// Tool channel that lists tools but fails every invocation.
struct BrokenInvocation;

#[async_trait]
impl ToolProvider for BrokenInvocation {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        ToolRegistry::with_builtins().list_tools().await
    }

    async fn call_tool(&self, _: &str, _: Value, _: &ToolContext) -> Result<Value, ToolError> {
        Err(ToolError::Infrastructure("worker crashed".into()))
    }
}

/// Answer model that plans a `document_search` call but fails every
/// retrieval-augmented prompt.
struct AnswerModelDown {
    calls: Mutex<usize>,
}

#[async_trait]
impl Generator for AnswerModelDown {
    fn model_name(&self) -> &str {
        "down"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> reportminer::Result<String> {
        *self.calls.lock() += 1;
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        if prompt.contains("Context from documents:") {
            return Err(Error::generation("503 service unavailable"));
        }
        Ok(r#"{"tool": "document_search", "input": {"question": "What was revenue?"}}"#.to_string())
    }
}

/// Embedding provider that is always rate limited.
struct RateLimited;

#[async_trait]
impl Embedder for RateLimited {
    fn model_name(&self) -> &str {
        "hash-embed-v1"
    }

    fn dims(&self) -> usize {
        128
    }

    async fn embed_batch(&self, _: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Transient("429 too many requests".into()))
    }
}

// ============ Harness ============

struct Harness {
    config: Config,
    repo: Arc<InMemoryRepository>,
    index: Arc<InMemoryVectorIndex>,
    ingestor: Arc<Ingestor>,
}

fn embeddings(model: &str, config: &Config) -> EmbeddingClient {
    EmbeddingClient::new(Arc::new(HashEmbedder::new(model, 128)), &config.embedding)
}

fn harness() -> Harness {
    harness_with(Config::with_db_path("unused.sqlite"))
}

fn harness_with(config: Config) -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = Arc::new(Ingestor::new(
        repo.clone(),
        index.clone(),
        embeddings("hash-embed-v1", &config),
        &config,
    ));
    Harness {
        config,
        repo,
        index,
        ingestor,
    }
}

impl Harness {
    async fn upload(&self, filename: &str, file_type: FileType, bytes: &[u8]) -> String {
        self.ingestor
            .register(NewDocument {
                filename: filename.to_string(),
                file_type,
                bytes: bytes.to_vec(),
            })
            .await
            .unwrap()
            .id
    }

    async fn ingest(&self, filename: &str, file_type: FileType, bytes: &[u8]) -> String {
        let id = self.upload(filename, file_type, bytes).await;
        self.ingestor.ingest(&id).await.unwrap();
        id
    }

    fn retrieval(&self, generator: Arc<dyn Generator>) -> Arc<RetrievalEngine> {
        self.retrieval_with_model(generator, "hash-embed-v1")
    }

    fn retrieval_with_model(&self, generator: Arc<dyn Generator>, model: &str) -> Arc<RetrievalEngine> {
        Arc::new(RetrievalEngine::new(
            self.index.clone(),
            embeddings(model, &self.config),
            generator,
            self.repo.clone(),
            &self.config,
        ))
    }

    fn service(&self, generator: Arc<dyn Generator>, tools: Arc<dyn ToolProvider>) -> QueryService {
        QueryService::new(self.retrieval(generator), tools, &self.config.agent)
    }
}

fn with_tools() -> QueryOptions {
    QueryOptions {
        use_tools: true,
        ..QueryOptions::default()
    }
}

// ============ Ingestion ============

#[tokio::test]
async fn csv_report_completes_with_table_and_full_log() {
    let h = harness();
    let id = h.upload("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;

    let chunk_count = match h.ingestor.ingest(&id).await.unwrap() {
        IngestOutcome::Completed { chunk_count, .. } => chunk_count,
        other => panic!("unexpected outcome {:?}", other),
    };

    let doc = h.repo.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.chunk_count, Some(chunk_count as i64));
    assert!(doc.processing_completed_at.is_some());

    let segments = h.repo.segments(&id).await.unwrap();
    let sequence: Vec<i64> = segments.iter().map(|s| s.sequence_number).collect();
    assert_eq!(sequence, vec![1, 2, 3]);
    assert!(chunk_count >= 3);

    let tables = h.repo.tables(&id).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].headers, vec!["Region", "Revenue", "Notes"]);
    assert_eq!(tables[0].numeric_column(1), vec![100.0, 80.0, 120.0]);

    let log = h.repo.processing_log(&id).await.unwrap();
    let stages: Vec<Stage> = log.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Extraction, Stage::Splitting, Stage::Embedding, Stage::Indexing]
    );
    assert!(log.iter().all(|e| e.status == StageStatus::Succeeded));

    assert_eq!(h.index.count("global").await.unwrap(), chunk_count);
}

#[tokio::test]
async fn whitespace_document_is_routed_to_review() {
    let h = harness();
    let id = h.upload("blank.txt", FileType::Txt, b"   \n\n\t\n").await;

    let outcome = h.ingestor.ingest(&id).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::NeedsReview { .. }));

    let doc = h.repo.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::RequiresReview);
    assert!(h.repo.chunks(&id).await.unwrap().is_empty());

    let log = h.repo.processing_log(&id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, StageStatus::NeedsReview);
}

#[tokio::test]
async fn corrupt_pdf_fails_at_extraction() {
    let h = harness();
    let id = h.upload("broken.pdf", FileType::Pdf, b"definitely not a pdf").await;

    let outcome = h.ingestor.ingest(&id).await.unwrap();
    match outcome {
        IngestOutcome::Failed { stage, .. } => assert_eq!(stage, Stage::Extraction),
        other => panic!("unexpected outcome {:?}", other),
    }

    let doc = h.repo.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(doc.error_message.is_some());
    assert_eq!(h.index.count("global").await.unwrap(), 0);
}

#[tokio::test]
async fn oversized_upload_fails() {
    let mut config = Config::with_db_path("unused.sqlite");
    config.ingest.max_file_bytes = 16;
    let h = harness_with(config);
    let id = h.upload("big.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;

    let outcome = h.ingestor.ingest(&id).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Failed {
            stage: Stage::Extraction,
            ..
        }
    ));
}

#[tokio::test]
async fn exhausted_embedding_retries_fail_the_document() {
    let mut config = Config::with_db_path("unused.sqlite");
    config.embedding.max_retries = 2;
    config.embedding.backoff_base_ms = 1;
    let repo = Arc::new(InMemoryRepository::new());
    let index = Arc::new(InMemoryVectorIndex::new());
    let ingestor = Ingestor::new(
        repo.clone(),
        index.clone(),
        EmbeddingClient::new(Arc::new(RateLimited), &config.embedding),
        &config,
    );
    let id = ingestor
        .register(NewDocument {
            filename: "sales.csv".to_string(),
            file_type: FileType::Csv,
            bytes: SALES_CSV.as_bytes().to_vec(),
        })
        .await
        .unwrap()
        .id;

    let outcome = ingestor.ingest(&id).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Failed {
            stage: Stage::Embedding,
            ..
        }
    ));

    let doc = repo.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    let log = repo.processing_log(&id).await.unwrap();
    let last = log.last().unwrap();
    assert_eq!(last.stage, Stage::Embedding);
    assert_eq!(last.status, StageStatus::Failed);
    assert_eq!(index.count("global").await.unwrap(), 0);
}

#[tokio::test]
async fn second_ingest_of_processed_document_is_skipped() {
    let h = harness();
    let id = h.ingest("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;

    let again = h.ingestor.ingest(&id).await.unwrap();
    assert_eq!(
        again,
        IngestOutcome::Skipped {
            status: DocumentStatus::Completed
        }
    );
    assert_eq!(h.repo.processing_log(&id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn abandoned_processing_claim_is_recovered() {
    let h = harness();
    let crashed = h.upload("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;
    let stuck = h.upload("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;

    // Workers claim both documents and die before finishing.
    assert!(h.repo.begin_processing(&crashed, Utc::now()).await.unwrap());
    assert!(h.repo.begin_processing(&stuck, Utc::now()).await.unwrap());

    // Within the lease the claims are respected.
    assert_eq!(
        h.ingestor.ingest(&crashed).await.unwrap(),
        IngestOutcome::Skipped {
            status: DocumentStatus::Processing
        }
    );
    assert!(!h.ingestor.reprocess(&stuck).await.unwrap());

    let mut config = Config::with_db_path("unused.sqlite");
    config.ingest.processing_lease_secs = 0;
    let recovering = Ingestor::new(
        h.repo.clone(),
        h.index.clone(),
        embeddings("hash-embed-v1", &config),
        &config,
    );

    let outcome = recovering.ingest(&crashed).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Completed { .. }));
    let doc = h.repo.get_document(&crashed).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);

    assert!(recovering.reprocess(&stuck).await.unwrap());
    let outcome = recovering.ingest(&stuck).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Completed { .. }));
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
    let h = harness();
    let id = h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let first: Vec<String> = h.repo.chunks(&id).await.unwrap().into_iter().map(|c| c.id).collect();
    let vectors = h.index.count("global").await.unwrap();
    let before: Vec<_> = first.iter().map(|c| h.index.get("global", c).unwrap()).collect();

    assert!(h.ingestor.reprocess(&id).await.unwrap());
    let outcome = h.ingestor.ingest(&id).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Completed { .. }));

    let second: Vec<String> = h.repo.chunks(&id).await.unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(first, second);
    assert_eq!(h.index.count("global").await.unwrap(), vectors);
    let after: Vec<_> = second.iter().map(|c| h.index.get("global", c).unwrap()).collect();
    assert_eq!(before, after);
    assert_eq!(h.repo.tables(&id).await.unwrap().len(), 1);
    assert_eq!(h.repo.processing_log(&id).await.unwrap().len(), 8);
}

#[tokio::test]
async fn reprocess_of_unknown_document_is_not_found() {
    let h = harness();
    let err = h.ingestor.reprocess("missing").await.unwrap_err();
    assert!(matches!(err, Error::DocumentNotFound(_)));
}

#[tokio::test]
async fn concurrent_ingest_of_one_document_runs_once() {
    let h = harness();
    let id = h.upload("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;

    let results = h.ingestor.ingest_many(vec![id.clone(); 4], 4).await;
    let completed = results
        .iter()
        .filter(|(_, r)| matches!(r, Ok(IngestOutcome::Completed { .. })))
        .count();
    let skipped = results
        .iter()
        .filter(|(_, r)| matches!(r, Ok(IngestOutcome::Skipped { .. })))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(skipped, 3);

    let doc = h.repo.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(h.repo.processing_log(&id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn ingest_many_keeps_input_order() {
    let h = harness();
    let a = h.upload("a.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;
    let b = h.upload("b.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let c = h.upload("c.pdf", FileType::Pdf, b"junk").await;

    let results = h
        .ingestor
        .ingest_many(vec![a.clone(), b.clone(), c.clone()], 2)
        .await;
    let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()]);
    assert!(matches!(results[2].1, Ok(IngestOutcome::Failed { .. })));
}

// ============ Retrieval ============

#[tokio::test]
async fn search_is_ranked_and_bounded() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    h.ingest("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;
    let engine = h.retrieval(ScriptedGenerator::new(&[], "ok"));

    let passages = engine.search("revenue growth by region", 3).await.unwrap();
    assert!(!passages.is_empty());
    assert!(passages.len() <= 3);
    for pair in passages.windows(2) {
        assert!(pair[0].source.score >= pair[1].source.score);
    }
    assert!(passages.iter().all(|p| p.source.filename.is_some()));
}

#[tokio::test]
async fn answer_sources_include_the_matching_chunk() {
    let h = harness();
    h.ingest("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;
    let q3 = h.ingest("q3.txt", FileType::Txt, b"Q3 revenue reached $2.4M").await;
    let chunk_id = h.repo.chunks(&q3).await.unwrap()[0].id.clone();
    let engine = h.retrieval(ScriptedGenerator::new(&["Revenue was $2.4M."], ""));

    let answer = engine.answer("What is the total revenue?", 5).await.unwrap();
    assert!(answer.sources.iter().any(|s| s.chunk_id == chunk_id));
}

#[tokio::test]
async fn larger_top_k_never_drops_a_chunk() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    h.ingest("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;
    let engine = h.retrieval(ScriptedGenerator::new(&[], "ok"));

    let mut previous: Vec<String> = Vec::new();
    for k in 1..=6 {
        let ids: Vec<String> = engine
            .search("revenue growth by region", k)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.source.chunk_id)
            .collect();
        assert!(ids.len() <= k);
        assert!(previous.iter().all(|id| ids.contains(id)), "k={} lost a chunk", k);
        previous = ids;
    }
}

#[tokio::test]
async fn search_only_returns_completed_documents() {
    let h = harness();
    let sales = h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let memo = h.ingest("memo.txt", FileType::Txt, MEMO_TXT.as_bytes()).await;

    // Back to pending: its vectors are still indexed but must not be served.
    assert!(h.ingestor.reprocess(&memo).await.unwrap());

    let engine = h.retrieval(ScriptedGenerator::new(&[], "ok"));
    let passages = engine.search("board hiring plan", 10).await.unwrap();
    assert!(!passages.is_empty());
    assert!(passages.iter().all(|p| p.source.document_id == sales));
}

#[tokio::test]
async fn empty_collection_still_answers_with_notice() {
    let h = harness();
    let generator = ScriptedGenerator::new(&["I could not find that in the documents."], "");
    let engine = h.retrieval(generator.clone());

    let answer = engine.answer("What was Q3 revenue?", 5).await.unwrap();
    assert_eq!(answer.text, "I could not find that in the documents.");
    assert!(answer.sources.is_empty());
    assert!(generator.last_prompt().contains(NO_CONTEXT_NOTICE));
}

#[tokio::test]
async fn answer_cites_included_passages() {
    let h = harness();
    let sales = h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let generator = ScriptedGenerator::new(&["East led with 120."], "");
    let engine = h.retrieval(generator.clone());

    let answer = engine.answer("Which region had the highest revenue?", 5).await.unwrap();
    assert_eq!(answer.text, "East led with 120.");
    assert!(!answer.sources.is_empty());
    assert!(answer.sources.iter().all(|s| s.document_id == sales));
    assert!(generator.last_prompt().contains("[Source: sales.csv]"));
}

#[tokio::test]
async fn query_with_other_embedding_model_is_rejected() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let engine = h.retrieval_with_model(ScriptedGenerator::new(&[], "ok"), "other-model");

    let err = engine.search("revenue", 5).await.unwrap_err();
    match err {
        Error::ModelMismatch { expected, actual } => {
            assert_eq!(expected, "hash-embed-v1");
            assert_eq!(actual, "other-model");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

// ============ Query service ============

#[tokio::test]
async fn plain_query_skips_the_agent() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let generator = ScriptedGenerator::new(&["Revenue totals 300."], "");
    let service = h.service(generator.clone(), Arc::new(ToolRegistry::with_builtins()));

    let response = service
        .answer(
            "Total revenue?",
            QueryOptions {
                session_id: Some("session-1".into()),
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.answer, "Revenue totals 300.");
    assert!(!response.tool_used);
    assert!(response.steps.is_empty());
    assert_eq!(response.session_id, "session-1");
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn missing_session_id_is_generated() {
    let h = harness();
    let service = h.service(
        ScriptedGenerator::new(&[], "nothing indexed"),
        Arc::new(ToolRegistry::with_builtins()),
    );
    let response = service.answer("anything?", QueryOptions::default()).await.unwrap();
    assert!(uuid::Uuid::parse_str(&response.session_id).is_ok());
}

#[tokio::test]
async fn agent_computes_statistics_then_answers() {
    let h = harness();
    let sales = h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let call = json!({
        "thought": "sum the revenue column",
        "tool": "statistics",
        "input": { "document_id": sales, "column": "revenue" }
    })
    .to_string();
    let generator = ScriptedGenerator::new(
        &[call.as_str(), r#"{"thought": "done", "final_answer": "Total revenue is 300 across 3 regions."}"#],
        "",
    );
    let service = h.service(generator, Arc::new(ToolRegistry::with_builtins()));

    let response = service.answer("What is total revenue?", with_tools()).await.unwrap();
    assert_eq!(response.answer, "Total revenue is 300 across 3 regions.");
    assert!(response.tool_used);
    assert_eq!(response.steps.len(), 2);

    let output = response.steps[0].output.as_ref().unwrap();
    assert_eq!(output["statistics"]["count"], 3);
    assert_eq!(output["statistics"]["sum"], 300.0);
    assert_eq!(output["statistics"]["max"], 120.0);
}

#[tokio::test]
async fn unknown_tool_is_fed_back_to_the_model() {
    let h = harness();
    let generator = ScriptedGenerator::new(
        &[
            r#"{"tool": "forecast", "input": {}}"#,
            r#"{"final_answer": "I cannot forecast."}"#,
        ],
        "",
    );
    let service = h.service(generator.clone(), Arc::new(ToolRegistry::with_builtins()));

    let response = service.answer("Forecast Q4", with_tools()).await.unwrap();
    assert_eq!(response.answer, "I cannot forecast.");
    assert!(!response.tool_used);
    let error = response.steps[0].error.as_deref().unwrap();
    assert!(error.contains("unknown tool 'forecast'"));
    assert!(generator.last_prompt().contains("Error from forecast"));
}

#[tokio::test]
async fn iteration_cap_returns_partial_answer() {
    let mut config = Config::with_db_path("unused.sqlite");
    config.agent.max_iterations = 2;
    let h = harness_with(config);
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;

    let generator = ScriptedGenerator::new(
        &[
            r#"{"tool": "document_search", "input": {"question": "revenue by region"}}"#,
            "North 100, South 80, East 120.",
            r#"{"tool": "list_documents", "input": {"limit": 5}}"#,
        ],
        r#"{"tool": "list_documents"}"#,
    );
    let service = h.service(generator, Arc::new(ToolRegistry::with_builtins()));

    let response = service.answer("Summarize revenue", with_tools()).await.unwrap();
    assert!(response.answer.starts_with(UNABLE_TO_COMPLETE));
    assert!(response.answer.contains("North 100, South 80, East 120."));
    assert!(response.tool_used);
    assert_eq!(response.steps.len(), 2);
    assert!(!response.sources.is_empty());
}

#[tokio::test]
async fn unreachable_tool_channel_falls_back_to_retrieval() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let generator = ScriptedGenerator::new(&["Answered without tools."], "");
    let service = h.service(generator.clone(), Arc::new(UnreachableTools));

    let response = service.answer("Total revenue?", with_tools()).await.unwrap();
    assert_eq!(response.answer, "Answered without tools.");
    assert!(!response.tool_used);
    assert!(response.steps.is_empty());
    assert!(!response.sources.is_empty());
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn failing_tool_invocation_falls_back_to_retrieval() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let generator = ScriptedGenerator::new(
        &[
            r#"{"tool": "list_documents", "input": {}}"#,
            "Fallback answer from retrieval.",
        ],
        "",
    );
    let service = h.service(generator.clone(), Arc::new(BrokenInvocation));

    let response = service.answer("List the reports", with_tools()).await.unwrap();
    assert_eq!(response.answer, "Fallback answer from retrieval.");
    assert!(!response.tool_used);
    assert_eq!(generator.call_count(), 2);
}

#[tokio::test]
async fn answer_model_failure_inside_tool_is_not_retried() {
    let h = harness();
    h.ingest("sales.csv", FileType::Csv, SALES_CSV.as_bytes()).await;
    let generator = Arc::new(AnswerModelDown {
        calls: Mutex::new(0),
    });
    let service = h.service(generator.clone(), Arc::new(ToolRegistry::with_builtins()));

    let err = service
        .answer("What was revenue?", with_tools())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Generation(_)));
    assert_eq!(*generator.calls.lock(), 2);
}

#[tokio::test]
async fn disabled_agent_ignores_tool_requests() {
    let mut config = Config::with_db_path("unused.sqlite");
    config.agent.enabled = false;
    let h = harness_with(config);
    let generator = ScriptedGenerator::new(&["plain answer"], "");
    let service = h.service(generator.clone(), Arc::new(ToolRegistry::with_builtins()));

    let response = service.answer("anything", with_tools()).await.unwrap();
    assert_eq!(response.answer, "plain answer");
    assert!(!response.tool_used);
    assert_eq!(generator.call_count(), 1);
}
