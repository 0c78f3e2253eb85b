//! Query entry point.
//!
//! [`QueryService::answer`] routes a question either to the agent loop or
//! straight to the Retrieval Engine. A broken tool channel never reaches
//! the caller: the service logs a warning and answers through plain
//! retrieval with `tool_used = false`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentStep};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::retrieval::{RetrievalEngine, Source};
use crate::traits::ToolProvider;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub use_tools: bool,
    /// Falls back to `retrieval.top_k` when unset.
    pub top_k: Option<usize>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub tool_used: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<AgentStep>,
    pub session_id: String,
}

pub struct QueryService {
    retrieval: Arc<RetrievalEngine>,
    agent: Agent,
    agent_enabled: bool,
}

impl QueryService {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        tools: Arc<dyn ToolProvider>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            agent: Agent::new(tools, retrieval.clone(), config),
            retrieval,
            agent_enabled: config.enabled,
        }
    }

    /// Replace the agent (e.g. one with a shorter iteration timeout).
    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agent = agent;
        self
    }

    pub async fn answer(&self, question: &str, options: QueryOptions) -> Result<QueryResponse> {
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let top_k = options
            .top_k
            .unwrap_or_else(|| self.retrieval.default_top_k())
            .max(1);

        if options.use_tools && self.agent_enabled {
            match self.agent.run(question, top_k).await {
                Ok(result) => {
                    info!(
                        session_id = %session_id,
                        tool_calls = result.successful_tool_calls,
                        completed = result.completed,
                        "answered in agent mode"
                    );
                    return Ok(QueryResponse {
                        answer: result.text,
                        sources: result.sources,
                        tool_used: result.successful_tool_calls > 0,
                        steps: result.steps,
                        session_id,
                    });
                }
                Err(Error::ToolInfrastructure(reason)) => {
                    warn!(
                        session_id = %session_id,
                        reason = %reason,
                        "tool channel unavailable, falling back to retrieval"
                    );
                }
                Err(other) => return Err(other),
            }
        }

        let answer = self.retrieval.answer(question, top_k).await?;
        Ok(QueryResponse {
            answer: answer.text,
            sources: answer.sources,
            tool_used: false,
            steps: Vec::new(),
            session_id,
        })
    }
}
