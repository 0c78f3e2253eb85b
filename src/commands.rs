//! CLI command implementations.
//!
//! [`App`] wires the SQLite-backed repository and vector index, the
//! embedding client and (on demand) the generation model from one
//! [`Config`]. Each `run_*` function backs one `reportminer` subcommand
//! and prints a human-readable report to stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tracing::error;

use crate::config::Config;
use crate::connector_fs::{load_upload, scan_directory};
use crate::db;
use crate::embedding::EmbeddingClient;
use crate::generation::create_generator;
use crate::index::{SqliteVectorIndex, VectorIndex};
use crate::ingest::{IngestOutcome, Ingestor, ReprocessFilter};
use crate::migrate;
use crate::models::{Document, FileType};
use crate::query::{QueryOptions, QueryService};
use crate::retrieval::RetrievalEngine;
use crate::store::{Repository, SqliteRepository};
use crate::traits::{ToolProvider, ToolRegistry};

/// Components shared by the CLI commands.
pub struct App {
    config: Config,
    pool: SqlitePool,
    repo: Arc<dyn Repository>,
    index: Arc<dyn VectorIndex>,
    embeddings: EmbeddingClient,
}

impl App {
    /// Connect to the database (creating the schema if needed) and build the
    /// embedding client.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        let embeddings = EmbeddingClient::from_config(&config.embedding)?;
        Ok(Self {
            config: config.clone(),
            repo: Arc::new(SqliteRepository::new(pool.clone())),
            index: Arc::new(SqliteVectorIndex::new(pool.clone())),
            pool,
            embeddings,
        })
    }

    pub fn ingestor(&self) -> Arc<Ingestor> {
        Arc::new(Ingestor::new(
            self.repo.clone(),
            self.index.clone(),
            self.embeddings.clone(),
            &self.config,
        ))
    }

    /// Query service over the built-in tools. Fails when the generation
    /// provider cannot be constructed (e.g. a missing API key).
    pub fn query_service(&self) -> Result<QueryService> {
        let generator = create_generator(&self.config.generation)?;
        let retrieval = Arc::new(RetrievalEngine::new(
            self.index.clone(),
            self.embeddings.clone(),
            generator,
            self.repo.clone(),
            &self.config,
        ));
        let tools: Arc<dyn ToolProvider> = Arc::new(ToolRegistry::with_builtins());
        Ok(QueryService::new(retrieval, tools, &self.config.agent))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn print_outcome(doc: &Document, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Completed {
            chunk_count,
            total_tokens,
        } => println!(
            "  {}  {}  completed ({} chunks, ~{} tokens)",
            doc.id, doc.filename, chunk_count, total_tokens
        ),
        IngestOutcome::Failed { stage, error } => println!(
            "  {}  {}  failed at {}: {}",
            doc.id, doc.filename, stage, error
        ),
        IngestOutcome::NeedsReview { reason } => println!(
            "  {}  {}  requires review: {}",
            doc.id, doc.filename, reason
        ),
        IngestOutcome::Skipped { status } => println!(
            "  {}  {}  skipped (status {})",
            doc.id, doc.filename, status
        ),
    }
}

/// `reportminer ingest <file>`: register one file and process it.
pub async fn run_ingest(config: &Config, path: &Path, file_type: Option<FileType>) -> Result<()> {
    let upload = load_upload(path, file_type)?;
    let app = App::open(config).await?;
    let ingestor = app.ingestor();

    let doc = ingestor.register(upload).await?;
    let outcome = ingestor.ingest(&doc.id).await?;

    println!("ingest {}", path.display());
    print_outcome(&doc, &outcome);
    app.close().await;

    if matches!(outcome, IngestOutcome::Failed { .. }) {
        bail!("document {} failed to process", doc.id);
    }
    Ok(())
}

/// `reportminer ingest-dir <dir>`: register every matching file, then
/// process them concurrently.
pub async fn run_ingest_dir(config: &Config, dir: &Path) -> Result<()> {
    let files = scan_directory(dir, &config.ingest)?;
    let app = App::open(config).await?;
    let ingestor = app.ingestor();

    let mut docs = Vec::with_capacity(files.len());
    for file in &files {
        let upload = load_upload(&file.path, Some(file.file_type))?;
        docs.push(ingestor.register(upload).await?);
    }

    let ids = docs.iter().map(|d| d.id.clone()).collect();
    let results = ingestor.ingest_many(ids, config.ingest.concurrency).await;

    println!("ingest-dir {}", dir.display());
    println!("  files found: {}", files.len());
    let (mut completed, mut failed, mut review) = (0, 0, 0);
    for (doc, (_, result)) in docs.iter().zip(&results) {
        match result {
            Ok(outcome) => {
                match outcome {
                    IngestOutcome::Completed { .. } => completed += 1,
                    IngestOutcome::Failed { .. } => failed += 1,
                    IngestOutcome::NeedsReview { .. } => review += 1,
                    IngestOutcome::Skipped { .. } => {}
                }
                print_outcome(doc, outcome);
            }
            Err(e) => {
                failed += 1;
                println!("  {}  {}  error: {}", doc.id, doc.filename, e);
            }
        }
    }
    println!("  completed: {}", completed);
    println!("  failed: {}", failed);
    println!("  requires review: {}", review);
    println!("ok");

    app.close().await;
    Ok(())
}

/// `reportminer status <id>`: document state and its processing log.
pub async fn run_status(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let Some(doc) = app.repo.get_document(id).await? else {
        app.close().await;
        bail!("Document not found: {}", id);
    };
    let log = app.repo.processing_log(id).await?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("filename:     {}", doc.filename);
    println!("file_type:    {}", doc.file_type);
    println!("size_bytes:   {}", doc.size_bytes);
    println!("status:       {}", doc.status);
    if let Some(err) = &doc.error_message {
        println!("error:        {}", err);
    }
    println!("created_at:   {}", doc.created_at.to_rfc3339());
    if let Some(t) = doc.processing_completed_at {
        println!("completed_at: {}", t.to_rfc3339());
    }
    if let Some(chunks) = doc.chunk_count {
        println!("chunks:       {}", chunks);
    }
    if let Some(tokens) = doc.total_tokens {
        println!("tokens:       ~{}", tokens);
    }
    println!();

    println!("--- Processing log ({}) ---", log.len());
    for entry in &log {
        let elapsed = (entry.completed_at - entry.started_at).num_milliseconds();
        print!("[{}] {} ({} ms)", entry.stage, entry.status.as_str(), elapsed);
        if let Some(detail) = &entry.detail {
            print!(": {}", detail);
        }
        if let Some(err) = &entry.error {
            print!(": {}", err);
        }
        println!();
    }

    app.close().await;
    Ok(())
}

/// `reportminer reprocess <id>`: requeue one document and run it again.
///
/// `pending` documents are ingested as they are. Terminal documents and
/// claims older than `ingest.processing_lease_secs` are reset first.
pub async fn run_reprocess(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let ingestor = app.ingestor();

    let Some(doc) = app.repo.get_document(id).await? else {
        app.close().await;
        bail!("Document not found: {}", id);
    };
    if !ingestor.requeue(&doc).await? {
        app.close().await;
        bail!(
            "Document {} cannot be reprocessed while its status is {}",
            id,
            doc.status
        );
    }
    let outcome = ingestor.ingest(id).await?;
    let doc = app
        .repo
        .get_document(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Document not found: {}", id))?;

    println!("reprocess {}", id);
    print_outcome(&doc, &outcome);
    app.close().await;
    Ok(())
}

/// `reportminer reprocess --status <status>`: requeue every matching
/// document and process them concurrently. `--status pending` dispatches
/// documents that were registered but never ingested.
pub async fn run_reprocess_batch(config: &Config, filter: &ReprocessFilter, dry_run: bool) -> Result<()> {
    let app = App::open(config).await?;
    let ingestor = app.ingestor();

    let selected = ingestor.select(filter).await?;
    println!(
        "reprocess --status {}{}",
        filter.status,
        filter
            .file_type
            .map(|t| format!(" --type {}", t))
            .unwrap_or_default()
    );
    println!("  matched: {}", selected.len());

    if dry_run {
        for doc in &selected {
            println!("  {}  {}  {}", doc.id, doc.filename, doc.status);
        }
        println!("dry run: nothing changed");
        app.close().await;
        return Ok(());
    }

    let ids = ingestor.requeue_matching(filter).await?;
    let results = ingestor.ingest_many(ids, config.ingest.concurrency).await;
    let (mut completed, mut failed) = (0, 0);
    for (id, result) in &results {
        match result {
            Ok(outcome) => {
                match outcome {
                    IngestOutcome::Completed { .. } => completed += 1,
                    IngestOutcome::Failed { .. } => failed += 1,
                    _ => {}
                }
                if let Some(doc) = app.repo.get_document(id).await? {
                    print_outcome(&doc, outcome);
                }
            }
            Err(e) => {
                failed += 1;
                println!("  {}  error: {}", id, e);
            }
        }
    }
    println!("  requeued: {}", results.len());
    println!("  completed: {}", completed);
    println!("  failed: {}", failed);

    app.close().await;
    Ok(())
}

/// `reportminer ask "<question>"`.
pub async fn run_ask(
    config: &Config,
    question: &str,
    use_tools: bool,
    top_k: Option<usize>,
    session_id: Option<String>,
) -> Result<()> {
    let app = App::open(config).await?;
    let service = app.query_service()?;
    let options = QueryOptions {
        use_tools,
        top_k,
        session_id,
    };

    let response = match service.answer(question, options).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "query failed");
            app.close().await;
            bail!("{}", e.user_message());
        }
    };

    println!("{}", response.answer);
    println!();
    if !response.sources.is_empty() {
        println!("Sources:");
        for (i, source) in response.sources.iter().enumerate() {
            println!(
                "  {}. [{:.3}] {} (chunk {})",
                i + 1,
                source.score,
                source.filename.as_deref().unwrap_or(&source.document_id),
                source.chunk_id
            );
        }
    }
    for step in &response.steps {
        if let Some(tool) = &step.tool {
            println!(
                "  step {}: {}{}",
                step.iteration,
                tool,
                if step.error.is_some() { " (error)" } else { "" }
            );
        }
    }
    println!("tool_used: {}", response.tool_used);
    println!("session: {}", response.session_id);

    app.close().await;
    Ok(())
}

/// `reportminer tools`: list the built-in tools.
pub async fn run_tools() -> Result<()> {
    let registry = ToolRegistry::with_builtins();
    let specs = registry.list_tools().await?;
    println!("{:<20} DESCRIPTION", "TOOL");
    for spec in specs {
        println!("{:<20} {}", spec.name, spec.description);
    }
    Ok(())
}
