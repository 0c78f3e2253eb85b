//! Retrieval-augmented answering.
//!
//! [`RetrievalEngine::answer`] embeds the question, pulls the top-k chunks
//! of `completed` documents from the vector index, packs them into a
//! context window bounded by `retrieval.context_token_budget`, and asks the
//! generation model to answer from that context only.
//!
//! Only documents whose status is `completed` are ever searched, so the
//! artifacts of an in-flight or failed ingestion never leak into answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::{estimate_tokens, CHARS_PER_TOKEN};
use crate::config::{Config, RetrievalConfig};
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::generation::{generate_with_timeout, rag_prompt, ChatMessage, Generator};
use crate::index::VectorIndex;
use crate::store::Repository;

/// A chunk that was included in an answer's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub document_id: String,
    pub chunk_id: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A retrieved passage: a [`Source`] plus its text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    #[serde(flatten)]
    pub source: Source,
    pub chunk_index: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<Source>,
}

pub struct RetrievalEngine {
    index: Arc<dyn VectorIndex>,
    embeddings: EmbeddingClient,
    generator: Arc<dyn Generator>,
    repo: Arc<dyn Repository>,
    config: RetrievalConfig,
    generation_timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embeddings: EmbeddingClient,
        generator: Arc<dyn Generator>,
        repo: Arc<dyn Repository>,
        config: &Config,
    ) -> Self {
        Self {
            index,
            embeddings,
            generator,
            repo,
            config: config.retrieval.clone(),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    pub fn default_top_k(&self) -> usize {
        self.config.top_k
    }

    /// Top `top_k` passages for `question`, best first, without generation.
    pub async fn search(&self, question: &str, top_k: usize) -> Result<Vec<Passage>> {
        let collection = &self.config.collection;
        match self.index.collection_model(collection).await? {
            Some(model) if model != self.embeddings.model_name() => {
                return Err(Error::ModelMismatch {
                    expected: model,
                    actual: self.embeddings.model_name().to_string(),
                });
            }
            Some(_) => {}
            None => {
                debug!(collection = %collection, "collection is empty");
                return Ok(Vec::new());
            }
        }

        let allowed = self.repo.completed_document_ids().await?;
        if allowed.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embeddings.embed_query(question).await?;
        let hits = self
            .index
            .query(collection, &vector, top_k, Some(&allowed))
            .await?;

        let mut filenames: HashMap<String, Option<String>> = HashMap::new();
        let mut passages = Vec::with_capacity(hits.len());
        for hit in hits {
            let document_id = hit.metadata.document_id;
            if !filenames.contains_key(&document_id) {
                let name = self
                    .repo
                    .get_document(&document_id)
                    .await?
                    .map(|d| d.filename);
                filenames.insert(document_id.clone(), name);
            }
            let filename = filenames.get(&document_id).cloned().flatten();
            passages.push(Passage {
                source: Source {
                    document_id,
                    chunk_id: hit.chunk_id,
                    score: hit.score,
                    filename,
                },
                chunk_index: hit.metadata.chunk_index,
                text: hit.metadata.text,
            });
        }
        Ok(passages)
    }

    /// Answer `question` from the indexed corpus.
    ///
    /// Zero hits still reach the generation model, with an empty-context
    /// notice, so the caller always gets an answer or a typed error.
    pub async fn answer(&self, question: &str, top_k: usize) -> Result<Answer> {
        let passages = self.search(question, top_k).await?;
        let (context, included) = build_context(&passages, self.config.context_token_budget);

        let prompt = rag_prompt(&context, question);
        let text = generate_with_timeout(
            self.generator.as_ref(),
            &[ChatMessage::user(prompt)],
            self.generation_timeout,
        )
        .await?;

        info!(
            retrieved = passages.len(),
            included,
            model = self.generator.model_name(),
            "answered from retrieved context"
        );

        Ok(Answer {
            text: text.trim().to_string(),
            sources: passages
                .into_iter()
                .take(included)
                .map(|p| p.source)
                .collect(),
        })
    }
}

fn context_block(passage: &Passage) -> String {
    let label = passage
        .source
        .filename
        .as_deref()
        .unwrap_or(&passage.source.document_id);
    format!("[Source: {}]\n{}", label, passage.text)
}

/// Pack passages (already best first) into a context string.
///
/// Returns the context and how many leading passages it contains. Lower
/// scored passages are dropped first; the top passage is truncated when it
/// alone exceeds the budget.
pub fn build_context(passages: &[Passage], budget_tokens: usize) -> (String, usize) {
    let mut blocks: Vec<String> = Vec::new();
    let mut used = 0;

    for (i, passage) in passages.iter().enumerate() {
        let block = context_block(passage);
        let cost = estimate_tokens(&block);
        if used + cost <= budget_tokens {
            used += cost;
            blocks.push(block);
            continue;
        }
        if i == 0 {
            let truncated: String = block.chars().take(budget_tokens * CHARS_PER_TOKEN).collect();
            if !truncated.trim().is_empty() {
                blocks.push(truncated);
            }
        }
        break;
    }

    let included = blocks.len();
    (blocks.join("\n\n---\n\n"), included)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, score: f32, text: &str) -> Passage {
        Passage {
            source: Source {
                document_id: "doc".into(),
                chunk_id: id.into(),
                score,
                filename: Some("report.pdf".into()),
            },
            chunk_index: 0,
            text: text.into(),
        }
    }

    #[test]
    fn context_keeps_everything_within_budget() {
        let passages = vec![passage("a", 0.9, "alpha"), passage("b", 0.5, "beta")];
        let (context, included) = build_context(&passages, 1000);
        assert_eq!(included, 2);
        assert!(context.find("alpha").unwrap() < context.find("beta").unwrap());
        assert!(context.contains("[Source: report.pdf]"));
    }

    #[test]
    fn context_drops_lowest_scoring_first() {
        let passages = vec![
            passage("a", 0.9, &"x".repeat(40)),
            passage("b", 0.8, &"y".repeat(40)),
            passage("c", 0.7, &"z".repeat(400)),
        ];
        let (context, included) = build_context(&passages, 40);
        assert_eq!(included, 2);
        assert!(!context.contains('z'));
    }

    #[test]
    fn oversized_top_passage_is_truncated() {
        let passages = vec![passage("a", 0.9, &"w ".repeat(500))];
        let (context, included) = build_context(&passages, 10);
        assert_eq!(included, 1);
        assert!(context.chars().count() <= 10 * CHARS_PER_TOKEN);
    }

    #[test]
    fn empty_input_gives_empty_context() {
        let (context, included) = build_context(&[], 100);
        assert!(context.is_empty());
        assert_eq!(included, 0);
    }
}
