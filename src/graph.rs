//! Knowledge-graph enrichment.
//!
//! Completed sections are packaged as tenant-tagged episodes and submitted
//! to an external graph service, which extracts entities and relationships
//! on its side. The vector store stays the source of truth: a submission
//! failure is recorded on the section and never undoes stored chunks.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::GraphConfig;
use crate::embedding::read_json;
use crate::error::ProviderError;
use crate::models::{Chunk, Document, SectionRecord, TenantId};
use crate::retry::{with_retry, RetryPolicy};

/// Approximate chars-per-token ratio used for the episode size ceiling.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub episode_id: String,
    pub name: String,
    pub body: String,
    /// RFC 3339 timestamp the episode's facts are valid from.
    pub reference_time: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeRef {
    pub uuid: String,
    #[serde(default)]
    pub entities_extracted: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub fact: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub valid_at: Option<String>,
}

#[async_trait]
pub trait GraphService: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn add_episode(
        &self,
        tenant: &TenantId,
        episode: &Episode,
    ) -> Result<EpisodeRef, ProviderError>;

    async fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        max_facts: usize,
    ) -> Result<Vec<Fact>, ProviderError>;
}

/// Used when `graph.provider = "disabled"`: no episodes, no facts.
pub struct DisabledGraphService;

#[async_trait]
impl GraphService for DisabledGraphService {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn add_episode(
        &self,
        _tenant: &TenantId,
        _episode: &Episode,
    ) -> Result<EpisodeRef, ProviderError> {
        Err(ProviderError::Rejected("graph service is disabled".to_string()))
    }

    async fn search(
        &self,
        _tenant: &TenantId,
        _query: &str,
        _max_facts: usize,
    ) -> Result<Vec<Fact>, ProviderError> {
        Ok(Vec::new())
    }
}

/// JSON-over-HTTP graph service. The tenant id is sent as the group id, so
/// the service partitions its graph per tenant.
pub struct HttpGraphService {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGraphService {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("graph.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            client,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.url, path));
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    facts: Vec<Fact>,
}

#[async_trait]
impl GraphService for HttpGraphService {
    async fn add_episode(
        &self,
        tenant: &TenantId,
        episode: &Episode,
    ) -> Result<EpisodeRef, ProviderError> {
        let body = serde_json::json!({
            "group_id": tenant.as_str(),
            "episode_id": episode.episode_id,
            "name": episode.name,
            "episode_body": episode.body,
            "reference_time": episode.reference_time,
            "metadata": episode.metadata,
        });
        let response = self.post("/episodes").json(&body).send().await?;
        let json = read_json("graph", response).await?;
        serde_json::from_value(json).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        max_facts: usize,
    ) -> Result<Vec<Fact>, ProviderError> {
        let body = serde_json::json!({
            "group_ids": [tenant.as_str()],
            "query": query,
            "max_facts": max_facts,
        });
        let response = self.post("/search").json(&body).send().await?;
        let json = read_json("graph", response).await?;
        let parsed: SearchResponse =
            serde_json::from_value(json).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(parsed.facts)
    }
}

pub fn create_graph_service(config: &GraphConfig) -> Result<Arc<dyn GraphService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGraphService)),
        "http" => Ok(Arc::new(HttpGraphService::new(config)?)),
        other => bail!("Unknown graph provider: {}", other),
    }
}

/// Stable for a given file version, so resubmitting the same content after
/// a retry reuses the same id.
pub fn episode_id(
    tenant: &TenantId,
    document_id: &str,
    section_position: i64,
    first_chunk: i64,
    last_chunk: i64,
    file_modified_at: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}-{}|{}",
            tenant, document_id, section_position, first_chunk, last_chunk, file_modified_at
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// What graph submission did for one section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphOutcome {
    pub episodes_created: i64,
    pub entities_extracted: i64,
    pub error: Option<String>,
}

pub struct GraphSubmitter {
    service: Arc<dyn GraphService>,
    policy: RetryPolicy,
    max_episode_chars: usize,
    chunks_per_episode: usize,
}

impl GraphSubmitter {
    pub fn new(service: Arc<dyn GraphService>, config: &GraphConfig) -> Self {
        Self::with_policy(service, config, config.retry_policy())
    }

    pub fn with_policy(
        service: Arc<dyn GraphService>,
        config: &GraphConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            policy,
            max_episode_chars: config.max_episode_tokens.max(1) * CHARS_PER_TOKEN,
            chunks_per_episode: config.chunks_per_episode.max(1),
        }
    }

    pub fn service(&self) -> &Arc<dyn GraphService> {
        &self.service
    }

    /// Submit a completed section's chunks as episodes of up to
    /// `chunks_per_episode` chunks. Stops at the first batch that still
    /// fails after retries; the error is reported, not raised.
    pub async fn submit_section(
        &self,
        tenant: &TenantId,
        document: &Document,
        section: &SectionRecord,
        chunks: &[Chunk],
        file_modified_at: i64,
    ) -> GraphOutcome {
        let mut outcome = GraphOutcome::default();
        if !self.service.is_enabled() || chunks.is_empty() {
            return outcome;
        }

        let reference_time = chrono::DateTime::from_timestamp(file_modified_at, 0)
            .unwrap_or_default()
            .to_rfc3339();

        for batch in chunks.chunks(self.chunks_per_episode) {
            let first = batch[0].chunk_index;
            let last = batch[batch.len() - 1].chunk_index;
            let joined = batch
                .iter()
                .map(|c| c.text.trim())
                .collect::<Vec<_>>()
                .join("\n\n");
            let body = truncate_chars(&joined, self.max_episode_chars);
            if body.len() < joined.len() {
                debug!(section = %section.id, "episode body truncated to token ceiling");
            }

            let episode = Episode {
                episode_id: episode_id(
                    tenant,
                    &document.id,
                    section.position,
                    first,
                    last,
                    file_modified_at,
                ),
                name: format!("{} §{} [{}-{}]", document.title, section.position, first, last),
                body: body.to_string(),
                reference_time: reference_time.clone(),
                metadata: serde_json::json!({
                    "document_id": document.id,
                    "source": document.source_path,
                    "category": document.category,
                    "section_position": section.position,
                    "chunk_range": [first, last],
                }),
            };

            match with_retry("graph", &self.policy, || {
                self.service.add_episode(tenant, &episode)
            })
            .await
            {
                Ok(reference) => {
                    outcome.episodes_created += 1;
                    outcome.entities_extracted += reference.entities_extracted;
                }
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        section = %section.id,
                        error = %e,
                        "graph submission failed; chunks remain searchable"
                    );
                    outcome.error = Some(e.to_string());
                    break;
                }
            }
        }
        outcome
    }

    /// Facts mentioning the query, for graph-augmented retrieval.
    pub async fn search(
        &self,
        tenant: &TenantId,
        query: &str,
        max_facts: usize,
    ) -> Result<Vec<Fact>, ProviderError> {
        if !self.service.is_enabled() {
            return Ok(Vec::new());
        }
        with_retry("graph", &self.policy, || {
            self.service.search(tenant, query, max_facts)
        })
        .await
    }
}
