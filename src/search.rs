//! Tenant-scoped retrieval: similarity, lexical, hybrid and graph modes.
//!
//! Hybrid scoring blends the two channels linearly:
//!
//! ```text
//! combined = (1 - text_weight) * similarity + text_weight * lexical
//! ```
//!
//! A chunk missing from one channel scores 0.0 there. Ties keep the order
//! the channels returned them in (similarity list first, then lexical-only
//! hits), so results are deterministic.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::graph::{Fact, GraphSubmitter};
use crate::models::{Chunk, TenantId};
use crate::store::{KnowledgeStore, ScoredChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchMode {
    Similarity,
    Lexical,
    Hybrid,
    Graph,
}

impl FromStr for SearchMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "similarity" => Ok(SearchMode::Similarity),
            "lexical" => Ok(SearchMode::Lexical),
            "hybrid" => Ok(SearchMode::Hybrid),
            "graph" => Ok(SearchMode::Graph),
            other => Err(PipelineError::Configuration(format!(
                "Unknown search mode: {}. Use similarity, lexical, hybrid, or graph.",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f64,
    pub similarity: f64,
    pub lexical: f64,
}

#[derive(Debug, Default)]
pub struct QueryResult {
    pub hits: Vec<SearchHit>,
    pub facts: Vec<Fact>,
    /// Channels that were skipped because their backend failed.
    pub degraded: Vec<String>,
}

/// Merge the two channels' candidates into ranked hits.
pub fn merge_hybrid(
    similarity: Vec<ScoredChunk>,
    lexical: Vec<ScoredChunk>,
    text_weight: f64,
    limit: usize,
) -> Vec<SearchHit> {
    let lex_scores: HashMap<String, f64> = lexical
        .iter()
        .map(|s| (s.chunk.id.clone(), s.score))
        .collect();
    let sim_ids: HashMap<String, f64> = similarity
        .iter()
        .map(|s| (s.chunk.id.clone(), s.score))
        .collect();

    let combine = |sim: f64, lex: f64| (1.0 - text_weight) * sim + text_weight * lex;

    let mut hits: Vec<SearchHit> = similarity
        .into_iter()
        .map(|s| {
            let lex = lex_scores.get(&s.chunk.id).copied().unwrap_or(0.0);
            SearchHit {
                score: combine(s.score, lex),
                similarity: s.score,
                lexical: lex,
                chunk: s.chunk,
            }
        })
        .collect();

    hits.extend(
        lexical
            .into_iter()
            .filter(|l| !sim_ids.contains_key(&l.chunk.id))
            .map(|l| SearchHit {
                score: combine(0.0, l.score),
                similarity: 0.0,
                lexical: l.score,
                chunk: l.chunk,
            }),
    );

    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(limit);
    hits
}

fn single_channel(scored: Vec<ScoredChunk>, lexical: bool) -> Vec<SearchHit> {
    scored
        .into_iter()
        .map(|s| SearchHit {
            score: s.score,
            similarity: if lexical { 0.0 } else { s.score },
            lexical: if lexical { s.score } else { 0.0 },
            chunk: s.chunk,
        })
        .collect()
}

pub struct RetrievalEngine {
    store: KnowledgeStore,
    embedder: Arc<Embedder>,
    graph: Arc<GraphSubmitter>,
    config: RetrievalConfig,
    max_facts: usize,
}

impl RetrievalEngine {
    pub fn new(
        store: KnowledgeStore,
        embedder: Arc<Embedder>,
        graph: Arc<GraphSubmitter>,
        config: RetrievalConfig,
        max_facts: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            graph,
            config,
            max_facts,
        }
    }

    pub async fn similarity_search(
        &self,
        tenant: &TenantId,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let scored = self.store.similarity_search(tenant, embedding, limit).await?;
        Ok(single_channel(scored, false))
    }

    pub async fn lexical_search(
        &self,
        tenant: &TenantId,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let scored = self.store.lexical_search(tenant, query_text, limit).await?;
        Ok(single_channel(scored, true))
    }

    /// Blend both channels. Without an embedding the similarity channel is
    /// empty and the ranking is lexical only.
    pub async fn hybrid_search(
        &self,
        tenant: &TenantId,
        embedding: Option<&[f32]>,
        query_text: &str,
        limit: usize,
        text_weight: f64,
    ) -> Result<Vec<SearchHit>> {
        if !(0.0..=1.0).contains(&text_weight) {
            return Err(PipelineError::Configuration(format!(
                "text_weight must be within [0, 1], got {}",
                text_weight
            )));
        }
        let pool = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        let similarity = match embedding {
            Some(v) => self.store.similarity_search(tenant, v, pool).await?,
            None => Vec::new(),
        };
        let lexical = match self.store.lexical_search(tenant, query_text, pool).await {
            Ok(hits) => hits,
            Err(e) if embedding.is_some() => {
                warn!(tenant = %tenant, error = %e, "lexical channel failed; similarity only");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        Ok(merge_hybrid(similarity, lexical, text_weight, limit))
    }

    /// Mode-dispatching entry point. The query is embedded on demand when no
    /// embedding is supplied; if that fails the lexical channel still
    /// answers.
    pub async fn query(
        &self,
        tenant: &TenantId,
        query_text: &str,
        query_embedding: Option<Vec<f32>>,
        mode: SearchMode,
        limit: Option<usize>,
        text_weight: Option<f64>,
    ) -> Result<QueryResult> {
        let limit = limit.unwrap_or(self.config.default_limit);
        let text_weight = text_weight.unwrap_or(self.config.text_weight);
        let mut result = QueryResult::default();

        if query_text.trim().is_empty() && query_embedding.is_none() {
            return Ok(result);
        }

        if mode == SearchMode::Lexical {
            result.hits = self.lexical_search(tenant, query_text, limit).await?;
            return Ok(result);
        }

        let embedding = match query_embedding {
            Some(v) => Some(v),
            None if self.embedder.is_enabled() => {
                match self.embedder.embed_query(tenant, query_text).await {
                    Ok(v) => Some(v),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(tenant = %tenant, error = %e, "query embedding failed; lexical only");
                        result.degraded.push("similarity".to_string());
                        None
                    }
                }
            }
            None => {
                result.degraded.push("similarity".to_string());
                None
            }
        };

        result.hits = match (mode, embedding.as_deref()) {
            (SearchMode::Similarity, Some(v)) => self.similarity_search(tenant, v, limit).await?,
            (SearchMode::Similarity, None) => self.lexical_search(tenant, query_text, limit).await?,
            (_, v) => {
                self.hybrid_search(tenant, v, query_text, limit, text_weight)
                    .await?
            }
        };

        if mode == SearchMode::Graph {
            match self.graph.search(tenant, query_text, self.max_facts).await {
                Ok(facts) => result.facts = facts,
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "graph search failed; chunk results only");
                    result.degraded.push("graph".to_string());
                }
            }
        }

        Ok(result)
    }
}
