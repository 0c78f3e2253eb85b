//! Embedding provider abstraction and the batching client.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIEmbedder`]**: calls an OpenAI-compatible `/embeddings` endpoint.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`HashEmbedder`]**: deterministic feature-hashing model, fully offline.
//!
//! Providers make exactly one attempt per call and classify failures as
//! [`ProviderError::Transient`] or [`ProviderError::Permanent`].
//! [`EmbeddingClient`] owns batching, bounded concurrency, timeouts and
//! retries on top of any provider.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited), 5xx, network errors and timeouts → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Backoff: `backoff_base_ms × 2^(attempt-1)`, exponent capped at 5

mod local_hash;

pub use local_hash::HashEmbedder;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Failure of a single provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Rate limit, server error, network error or timeout. Worth retrying.
    #[error("{0}")]
    Transient(String),
    /// Bad request, auth failure, malformed response. Not retried.
    #[error("{0}")]
    Permanent(String),
}

/// An embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed one batch, one vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | [`HashEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "local" => {
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| "hash-embed-v1".to_string());
            let dims = config.dims.unwrap_or(256);
            Ok(Arc::new(HashEmbedder::new(model, dims)))
        }
        other => Err(Error::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Client ============

/// Batching, retrying, time-bounded wrapper around an [`Embedder`].
#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    concurrency: usize,
    max_retries: u32,
    backoff_base: Duration,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self::new(create_embedder(config)?, config))
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Embed `texts`, preserving input order.
    ///
    /// Batches run up to `concurrency` at a time. Any batch exhausting its
    /// retries fails the whole call; partial results are never returned.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let calls: Vec<_> = texts
            .chunks(self.batch_size)
            .map(|batch| self.embed_with_retry(batch))
            .collect();
        let results: Vec<Vec<Vec<f32>>> = stream::iter(calls)
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Embed a single query text with the same model.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.embed(&[text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| Error::embedding("empty embedding response"))
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = String::from("embedding failed after retries");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "embedding backoff");
                tokio::time::sleep(delay).await;
            }

            let outcome = tokio::time::timeout(self.timeout, self.embedder.embed_batch(batch)).await;
            match outcome {
                Ok(Ok(vectors)) => return self.validate(batch, vectors),
                Ok(Err(ProviderError::Permanent(msg))) => {
                    return Err(Error::embedding(msg));
                }
                Ok(Err(ProviderError::Transient(msg))) => {
                    warn!(attempt, model = self.model_name(), error = %msg, "transient embedding failure");
                    last_err = msg;
                }
                Err(_) => {
                    warn!(
                        attempt,
                        model = self.model_name(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "embedding call timed out"
                    );
                    last_err = format!("embedding call timed out after {:?}", self.timeout);
                }
            }
        }

        Err(Error::embedding(format!(
            "{} (after {} retries)",
            last_err, self.max_retries
        )))
    }

    fn validate(&self, batch: &[String], vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != batch.len() {
            return Err(Error::embedding(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        let dims = self.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(Error::embedding(format!(
                "expected {} dimensions, got {}",
                dims,
                bad.len()
            )));
        }
        Ok(vectors)
    }
}

// ============ Disabled Provider ============

/// A no-op provider that always fails.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Permanent(
            "Embedding provider is disabled".to_string(),
        ))
    }
}

// ============ HTTP helpers ============

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

/// Map a non-success status to a transient or permanent failure.
async fn classify_status(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let msg = format!("{} API error {}: {}", provider, status, body_text);
    // Rate limited or server error: retry
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(msg)
    } else {
        ProviderError::Permanent(msg)
    }
}

fn required_model(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config.model.clone().ok_or_else(|| {
        Error::Config(format!("embedding.model required for {} provider", provider))
    })?;
    let dims = config.dims.ok_or_else(|| {
        Error::Config(format!("embedding.dims required for {} provider", provider))
    })?;
    Ok((model, dims))
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {url}/embeddings` (default `https://api.openai.com/v1`).
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("OpenAI request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(classify_status("OpenAI", response).await);
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("OpenAI response body: {}", e)))?;
        parse_openai_response(&json).map_err(ProviderError::Permanent)
    }
}

/// Extract `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> std::result::Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| "Invalid OpenAI response: missing data array".to_string())?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| "Invalid OpenAI response: missing embedding".to_string())?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        if !response.status().is_success() {
            return Err(classify_status("Ollama", response).await);
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("Ollama response body: {}", e)))?;
        parse_ollama_response(&json).map_err(ProviderError::Permanent)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> std::result::Result<Vec<Vec<f32>>, String> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| "Invalid Ollama response: missing embeddings array".to_string())?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| "Invalid Ollama response: embedding is not an array".to_string())?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use reportminer::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
