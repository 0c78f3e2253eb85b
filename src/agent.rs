//! Bounded tool-using agent loop.
//!
//! Each iteration asks the generation model for one JSON decision:
//!
//! ```text
//! {"thought": "...", "tool": "statistics", "input": {"document_id": "...", "column": "Revenue"}}
//! {"thought": "...", "final_answer": "..."}
//! ```
//!
//! Tool output is appended to the transcript before the next iteration.
//! A reply that is not JSON is taken as the final answer. After
//! `agent.max_iterations` iterations without a final answer the loop stops
//! and returns an answer starting with [`UNABLE_TO_COMPLETE`], plus the
//! best partial answer a `document_search` call produced.
//!
//! Discovery or invocation failures of the tool channel abort the run with
//! [`Error::ToolInfrastructure`]; tool-logic errors and unknown tool names
//! are fed back to the model as observations. Generation failures and model
//! mismatches raised by a tool end the run with the same error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::generation::{generate_with_timeout, ChatMessage, Generator};
use crate::retrieval::{RetrievalEngine, Source};
use crate::traits::{ToolContext, ToolError, ToolProvider, ToolSpec};

/// Marker that opens the answer when the iteration cap is reached.
pub const UNABLE_TO_COMPLETE: &str = "Unable to complete";

/// Name of the tool whose answers count as partial answers.
const SEARCH_TOOL: &str = "document_search";

/// One entry of the agent transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStep {
    pub iteration: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentAnswer {
    pub text: String,
    pub sources: Vec<Source>,
    pub steps: Vec<AgentStep>,
    /// Tool calls that returned successfully.
    pub successful_tool_calls: usize,
    /// `false` when the iteration cap was reached.
    pub completed: bool,
}

/// What the model asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Tool {
        thought: Option<String>,
        tool: String,
        input: Value,
    },
    Final {
        thought: Option<String>,
        answer: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default, alias = "tool_input", alias = "parameters")]
    input: Option<Value>,
    #[serde(default, alias = "answer")]
    final_answer: Option<Value>,
}

/// Interpret a model reply. Anything that is not a JSON decision is a
/// final answer.
pub fn parse_decision(reply: &str) -> Decision {
    let trimmed = reply.trim();
    let plain = || Decision::Final {
        thought: None,
        answer: trimmed.to_string(),
    };

    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return plain(),
    };
    let raw: RawDecision = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(_) => return plain(),
    };

    if let Some(answer) = raw.final_answer {
        let answer = match answer {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Decision::Final {
            thought: raw.thought,
            answer,
        };
    }
    match raw.tool {
        Some(tool) if !tool.trim().is_empty() => Decision::Tool {
            thought: raw.thought,
            tool: tool.trim().to_string(),
            input: raw.input.unwrap_or_else(|| Value::Object(Default::default())),
        },
        _ => plain(),
    }
}

/// System prompt describing the tools and the reply protocol.
pub fn system_prompt(tools: &[ToolSpec]) -> String {
    let mut catalog = String::new();
    for (i, tool) in tools.iter().enumerate() {
        catalog.push_str(&format!(
            "{}. {} - {}\n   parameters: {}\n",
            i + 1,
            tool.name,
            tool.description,
            tool.parameters
        ));
    }
    format!(
        "You are an analyst answering questions about a collection of report documents.\n\n\
Available tools:\n{catalog}\n\
Reply with exactly one JSON object and nothing else.\n\
To call a tool:\n\
{{\"thought\": \"why this tool\", \"tool\": \"<tool name>\", \"input\": {{ ... }}}}\n\
To answer:\n\
{{\"thought\": \"what the observations show\", \"final_answer\": \"<answer for the user>\"}}\n\n\
Rules:\n\
1. Use {SEARCH_TOOL} to find facts in the documents before answering\n\
2. Use the analysis tools for numbers, statistics, comparisons and tone\n\
3. Base the final answer only on tool observations and cite document names\n\
4. If the tools return nothing relevant, say that the documents do not contain the answer"
    )
}

pub struct Agent {
    tools: Arc<dyn ToolProvider>,
    retrieval: Arc<RetrievalEngine>,
    generator: Arc<dyn Generator>,
    max_iterations: usize,
    iteration_timeout: Duration,
}

impl Agent {
    pub fn new(
        tools: Arc<dyn ToolProvider>,
        retrieval: Arc<RetrievalEngine>,
        config: &AgentConfig,
    ) -> Self {
        let generator = retrieval.generator().clone();
        Self {
            tools,
            retrieval,
            generator,
            max_iterations: config.max_iterations.max(1),
            iteration_timeout: Duration::from_secs(config.iteration_timeout_secs),
        }
    }

    /// Override the per-iteration timeout.
    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = timeout;
        self
    }

    pub async fn run(&self, question: &str, top_k: usize) -> Result<AgentAnswer> {
        let specs = self.tools.list_tools().await.map_err(|e| {
            Error::ToolInfrastructure(format!("tool discovery failed: {}", e))
        })?;
        let known: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let ctx = ToolContext::new(self.retrieval.clone(), top_k);

        let mut messages = vec![
            ChatMessage::system(system_prompt(&specs)),
            ChatMessage::user(question),
        ];
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut sources: Vec<Source> = Vec::new();
        let mut partial: Option<String> = None;
        let mut successful = 0usize;

        for iteration in 1..=self.max_iterations {
            let reply =
                generate_with_timeout(self.generator.as_ref(), &messages, self.iteration_timeout)
                    .await?;
            messages.push(ChatMessage::assistant(reply.clone()));

            let (thought, tool, input) = match parse_decision(&reply) {
                Decision::Final { thought, answer } => {
                    steps.push(AgentStep {
                        iteration,
                        thought,
                        tool: None,
                        input: Value::Null,
                        output: None,
                        error: None,
                    });
                    info!(iterations = iteration, tool_calls = successful, "agent answered");
                    return Ok(AgentAnswer {
                        text: answer,
                        sources,
                        steps,
                        successful_tool_calls: successful,
                        completed: true,
                    });
                }
                Decision::Tool {
                    thought,
                    tool,
                    input,
                } => (thought, tool, input),
            };

            let outcome = if known.contains(tool.as_str()) {
                debug!(iteration, tool = %tool, "calling tool");
                match tokio::time::timeout(
                    self.iteration_timeout,
                    self.tools.call_tool(&tool, input.clone(), &ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Infrastructure(format!(
                        "tool {} timed out after {:?}",
                        tool, self.iteration_timeout
                    ))),
                }
            } else {
                Err(ToolError::invalid(format!(
                    "unknown tool '{}'; available tools: {}",
                    tool,
                    specs
                        .iter()
                        .map(|s| s.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )))
            };

            let mut step = AgentStep {
                iteration,
                thought,
                tool: Some(tool.clone()),
                input,
                output: None,
                error: None,
            };
            let observation = match outcome {
                Ok(output) => {
                    successful += 1;
                    if tool == SEARCH_TOOL {
                        record_search(&output, &mut partial, &mut sources);
                    }
                    let observation = format!("Observation from {}: {}", tool, output);
                    step.output = Some(output);
                    observation
                }
                Err(ToolError::Invalid(msg)) => {
                    debug!(iteration, tool = %tool, error = %msg, "tool reported an error");
                    let observation = format!("Error from {}: {}", tool, msg);
                    step.error = Some(msg);
                    observation
                }
                Err(ToolError::Infrastructure(msg)) => {
                    warn!(iteration, tool = %tool, error = %msg, "tool channel failed");
                    return Err(Error::ToolInfrastructure(msg));
                }
                Err(ToolError::Generation(msg)) => {
                    warn!(iteration, tool = %tool, error = %msg, "answer model failed inside tool");
                    return Err(Error::Generation(msg));
                }
                Err(ToolError::ModelMismatch { expected, actual }) => {
                    return Err(Error::ModelMismatch { expected, actual });
                }
            };
            steps.push(step);
            messages.push(ChatMessage::user(observation));
        }

        warn!(
            max_iterations = self.max_iterations,
            "agent reached the iteration limit without a final answer"
        );
        let mut text = format!(
            "{}: no final answer after {} reasoning steps.",
            UNABLE_TO_COMPLETE, self.max_iterations
        );
        if let Some(partial) = partial {
            text.push_str("\n\nBest partial answer:\n");
            text.push_str(&partial);
        }
        Ok(AgentAnswer {
            text,
            sources,
            steps,
            successful_tool_calls: successful,
            completed: false,
        })
    }
}

/// Keep the latest `document_search` answer and merge its sources.
fn record_search(output: &Value, partial: &mut Option<String>, sources: &mut Vec<Source>) {
    if let Some(answer) = output.get("answer").and_then(|a| a.as_str()) {
        if !answer.trim().is_empty() {
            *partial = Some(answer.trim().to_string());
        }
    }
    let found: Vec<Source> = output
        .get("sources")
        .cloned()
        .and_then(|s| serde_json::from_value(s).ok())
        .unwrap_or_default();
    for source in found {
        if !sources.iter().any(|s| s.chunk_id == source.chunk_id) {
            sources.push(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_call() {
        let reply = r#"{"thought": "need numbers", "tool": "statistics", "input": {"column": "Revenue"}}"#;
        match parse_decision(reply) {
            Decision::Tool { thought, tool, input } => {
                assert_eq!(thought.as_deref(), Some("need numbers"));
                assert_eq!(tool, "statistics");
                assert_eq!(input["column"], "Revenue");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_fenced_final_answer() {
        let reply = "```json\n{\"thought\": \"done\", \"final_answer\": \"Revenue was $2.4M\"}\n```";
        assert_eq!(
            parse_decision(reply),
            Decision::Final {
                thought: Some("done".into()),
                answer: "Revenue was $2.4M".into()
            }
        );
    }

    #[test]
    fn non_json_is_final_answer() {
        assert_eq!(
            parse_decision("  The total is 42.  "),
            Decision::Final {
                thought: None,
                answer: "The total is 42.".into()
            }
        );
    }

    #[test]
    fn tool_without_input_gets_empty_object() {
        match parse_decision(r#"{"tool": "list_documents"}"#) {
            Decision::Tool { input, .. } => assert!(input.as_object().unwrap().is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn prompt_lists_tools() {
        let specs = vec![ToolSpec {
            name: "sentiment".into(),
            description: "tone".into(),
            builtin: true,
            parameters: serde_json::json!({"type": "object"}),
        }];
        let prompt = system_prompt(&specs);
        assert!(prompt.contains("1. sentiment - tone"));
        assert!(prompt.contains("final_answer"));
    }

    #[test]
    fn search_output_becomes_partial_answer() {
        let output = serde_json::json!({
            "answer": "Q3 revenue reached $2.4M",
            "sources": [{"document_id": "d", "chunk_id": "c", "score": 0.9}]
        });
        let mut partial = None;
        let mut sources = Vec::new();
        record_search(&output, &mut partial, &mut sources);
        record_search(&output, &mut partial, &mut sources);
        assert_eq!(partial.as_deref(), Some("Q3 revenue reached $2.4M"));
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].filename, None);
    }
}
