//! Answer-model abstraction.
//!
//! The [`Generator`] trait turns a list of chat messages into text. The
//! Retrieval Engine and the agent loop both go through it, so tests can
//! swap in a scripted implementation.
//!
//! Providers:
//! - **[`DisabledGenerator`]**: fails every call.
//! - **[`OpenAIGenerator`]**: `POST {url}/chat/completions`.
//! - **[`OllamaGenerator`]**: `POST {url}/api/chat` with `stream: false`.
//!
//! Unlike embeddings, generation is not retried: a failure or timeout
//! surfaces immediately as [`Error::Generation`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Shown to the model in place of context when retrieval found nothing.
pub const NO_CONTEXT_NOTICE: &str = "(No relevant passages were found in the indexed documents.)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Create the [`Generator`] named by `config.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => Err(Error::Config(format!(
            "Unknown generation provider: {}",
            other
        ))),
    }
}

/// Run one generation call bounded by `timeout`.
pub async fn generate_with_timeout(
    generator: &dyn Generator,
    messages: &[ChatMessage],
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, generator.generate(messages)).await {
        Ok(result) => result,
        Err(_) => Err(Error::generation(format!(
            "{} did not answer within {:?}",
            generator.model_name(),
            timeout
        ))),
    }
}

/// Prompt for a retrieval-augmented answer.
///
/// An empty `context` is replaced by [`NO_CONTEXT_NOTICE`] so the model is
/// still asked, and told there is nothing to go on.
pub fn rag_prompt(context: &str, question: &str) -> String {
    let context = if context.trim().is_empty() {
        NO_CONTEXT_NOTICE
    } else {
        context
    };
    format!(
        "You are an assistant answering questions about a collection of report documents. \
Use only the context below to answer the question at the end. If the context does not \
contain the answer, say that you don't have enough information in the documents to answer.\n\n\
Context from documents:\n{context}\n\n\
Question: {question}\n\n\
Instructions:\n\
1. Base your answer strictly on the provided context\n\
2. Mention which document the information comes from when possible\n\
3. Quote figures exactly as they appear\n\
4. If no relevant information is found, say so plainly\n\
5. Keep the answer concise but informative\n\n\
Answer:"
    )
}

// ============ Disabled Provider ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> Result<String> {
        Err(Error::generation("generation provider is disabled"))
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

async fn error_body(provider: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::generation(format!("{} API error {}: {}", provider, status, body))
}

// ============ OpenAI Provider ============

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible servers.
///
/// Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    model: String,
    temperature: f32,
    max_tokens: u32,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::generation(format!("OpenAI request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_body("OpenAI", response).await);
        }
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::generation(format!("OpenAI response body: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::generation("OpenAI response contained no message"))
    }
}

// ============ Ollama Provider ============

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<CompletionMessage>,
}

/// Chat client for a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaGenerator {
    model: String,
    temperature: f32,
    max_tokens: u32,
    url: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            url: url.trim_end_matches('/').to_string(),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::generation(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        if !response.status().is_success() {
            return Err(error_body("Ollama", response).await);
        }
        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| Error::generation(format!("Ollama response body: {}", e)))?;
        parsed
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| Error::generation("Ollama response contained no message"))
    }
}
