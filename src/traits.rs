//! Extension traits for analytical tools.
//!
//! The agent loop never calls tools directly. It talks to a
//! [`ToolProvider`], the tool channel, which supports discovery
//! ([`list_tools`](ToolProvider::list_tools)) and invocation
//! ([`call_tool`](ToolProvider::call_tool)). [`ToolRegistry`] is the
//! in-process provider; other providers (a remote tool server, a test
//! double that simulates a broken channel) implement the same trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               ToolRegistry               │
//! │  ┌──────────────┐ ┌───────────────────┐  │
//! │  │  Built-in    │ │  Custom (Rust)    │  │
//! │  │ search/stats │ │  Tools            │  │
//! │  └──────────────┘ └───────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼  ToolProvider
//!          Agent::run() → QueryService
//! ```
//!
//! # Errors
//!
//! A tool distinguishes two failure classes through [`ToolError`]:
//! - [`ToolError::Invalid`]: bad parameters, unknown document, nothing to
//!   compute. The agent feeds the message back into its transcript.
//! - [`ToolError::Infrastructure`]: the channel or a backing service is
//!   broken. The agent abandons tool mode and the query service falls back
//!   to plain retrieval.
//! - [`ToolError::Generation`], [`ToolError::ModelMismatch`]: failures
//!   the caller must see. The agent returns them as the matching [`Error`].
//!
//! # Usage
//!
//! ```rust
//! use reportminer::traits::ToolRegistry;
//!
//! let mut tools = ToolRegistry::with_builtins();
//! // tools.register(Box::new(MyTool::new()));
//! assert!(tools.find("document_search").is_some());
//! ```

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::Error;
use crate::models::{Document, DocumentStatus, KeyValue, StructuredTable, TextSegment};
use crate::retrieval::{Answer, Passage, RetrievalEngine};
use crate::store::Repository;
use crate::tools;

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

/// Failure of a tool call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// Tool-logic failure. Reported back to the agent as an observation.
    #[error("{0}")]
    Invalid(String),
    /// Broken tool channel or backing service.
    #[error("{0}")]
    Infrastructure(String),
    /// Answer-model failure inside a tool. Ends the request with
    /// [`Error::Generation`] instead of a fallback.
    #[error("{0}")]
    Generation(String),
    /// The tool queried an index built with another embedding model.
    #[error("collection uses '{expected}', got '{actual}'")]
    ModelMismatch { expected: String, actual: String },
}

impl ToolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

impl From<Error> for ToolError {
    fn from(err: Error) -> Self {
        match err {
            Error::DocumentNotFound(_) | Error::Extraction { .. } | Error::Config(_) => {
                ToolError::Invalid(err.to_string())
            }
            Error::Generation(msg) => ToolError::Generation(msg),
            Error::ModelMismatch { expected, actual } => ToolError::ModelMismatch { expected, actual },
            Error::Embedding(_) | Error::ToolInfrastructure(_) | Error::Storage(_) => {
                ToolError::Infrastructure(err.to_string())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// An analytical tool the agent can discover and call.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use reportminer::traits::{Tool, ToolContext, ToolError};
///
/// pub struct DocumentCountTool;
///
/// #[async_trait]
/// impl Tool for DocumentCountTool {
///     fn name(&self) -> &str { "document_count" }
///     fn description(&self) -> &str { "Count processed documents" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {} })
///     }
///
///     async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
///         let docs = ctx.list_documents(1000).await?;
///         Ok(json!({ "count": docs.len() }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores (e.g. `"extract_numbers"`).
    fn name(&self) -> &str;

    /// One-line description the agent uses to pick a tool.
    fn description(&self) -> &str;

    /// Whether this tool ships with the crate. Defaults to `false`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema (`type: "object"`) describing the parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `params` is always a JSON object.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Discovery record for one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            parameters: tool.parameters_schema(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ToolProvider
// ═══════════════════════════════════════════════════════════════════════

/// The tool channel used by the agent.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError>;

    /// Invoke `name`. An unknown name is a [`ToolError::Invalid`].
    async fn call_tool(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Bridge from a tool to the indexed corpus.
///
/// Created once per query and handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    retrieval: Arc<RetrievalEngine>,
    repo: Arc<dyn Repository>,
    top_k: usize,
}

impl ToolContext {
    pub fn new(retrieval: Arc<RetrievalEngine>, top_k: usize) -> Self {
        let repo = retrieval.repository().clone();
        Self {
            retrieval,
            repo,
            top_k: top_k.max(1),
        }
    }

    /// The `top_k` requested for the current query.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Retrieval-augmented answer with sources.
    pub async fn answer(&self, question: &str, top_k: usize) -> Result<Answer, ToolError> {
        Ok(self.retrieval.answer(question, top_k).await?)
    }

    /// Raw similarity hits, best first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, ToolError> {
        Ok(self.retrieval.search(query, top_k).await?)
    }

    /// Completed documents, newest first.
    pub async fn list_documents(&self, limit: usize) -> Result<Vec<Document>, ToolError> {
        Ok(self
            .repo
            .list_documents(Some(DocumentStatus::Completed), limit)
            .await?)
    }

    /// A document by id, or [`ToolError::Invalid`] if it is unknown or
    /// not yet completed.
    pub async fn document(&self, id: &str) -> Result<Document, ToolError> {
        match self.repo.get_document(id).await? {
            Some(doc) if doc.status == DocumentStatus::Completed => Ok(doc),
            Some(doc) => Err(ToolError::invalid(format!(
                "document {} is {}, not completed",
                id, doc.status
            ))),
            None => Err(ToolError::invalid(format!("unknown document: {}", id))),
        }
    }

    /// Segments of a completed document in sequence order.
    pub async fn segments(&self, id: &str) -> Result<Vec<TextSegment>, ToolError> {
        self.document(id).await?;
        let mut segments = self.repo.segments(id).await?;
        segments.sort_by_key(|s| s.sequence_number);
        Ok(segments)
    }

    /// Full text of a completed document, segments joined by blank lines.
    pub async fn document_text(&self, id: &str) -> Result<String, ToolError> {
        let segments = self.segments(id).await?;
        Ok(segments
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    pub async fn tables(&self, id: &str) -> Result<Vec<StructuredTable>, ToolError> {
        self.document(id).await?;
        Ok(self.repo.tables(id).await?)
    }

    pub async fn key_values(&self, id: &str) -> Result<Vec<KeyValue>, ToolError> {
        self.document(id).await?;
        Ok(self.repo.key_values(id).await?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for tools (built-in and custom Rust).
///
/// Use [`ToolRegistry::with_builtins`] to create a registry pre-loaded
/// with the analytical tools from [`crate::tools`], then optionally call
/// [`register`](ToolRegistry::register) to add custom ones.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Create a registry pre-loaded with every built-in tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tool in tools::builtins() {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool. A tool with the same name replaces the old one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    /// Get all registered tools.
    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    /// Find a tool by name.
    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Return the count of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for ToolRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        Ok(self.tools.iter().map(|t| ToolSpec::of(t.as_ref())).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self
            .find(name)
            .ok_or_else(|| ToolError::invalid(format!("unknown tool: {}", name)))?;
        let params = if params.is_object() {
            params
        } else {
            serde_json::json!({})
        };
        tool.execute(params, ctx).await
    }
}
