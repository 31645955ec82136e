use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub boundary: BoundaryConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Fixed,
    Semantic,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_chars_per_page")]
    pub chars_per_page: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            chars_per_page: default_chars_per_page(),
        }
    }
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::Fixed
}
fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_chars_per_page() -> usize {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_ms: default_backoff_ms(),
            max_concurrent_batches: default_max_concurrent_batches(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.timeout_secs),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_ms() -> u64 {
    1000
}
fn default_max_concurrent_batches() -> usize {
    4
}
fn default_cache_capacity() -> usize {
    4096
}

/// Semantic boundary inference (LLM) settings.
#[derive(Debug, Deserialize, Clone)]
pub struct BoundaryConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl BoundaryConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.timeout_secs),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_graph_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_episode_tokens")]
    pub max_episode_tokens: usize,
    #[serde(default = "default_chunks_per_episode")]
    pub chunks_per_episode: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            api_key_env: default_graph_key_env(),
            max_episode_tokens: default_max_episode_tokens(),
            chunks_per_episode: default_chunks_per_episode(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_ms: default_backoff_ms(),
            max_facts: default_max_facts(),
        }
    }
}

impl GraphConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.timeout_secs),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

fn default_graph_key_env() -> String {
    "GRAPH_API_KEY".to_string()
}
fn default_max_episode_tokens() -> usize {
    2000
}
fn default_chunks_per_episode() -> usize {
    4
}
fn default_max_facts() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            text_weight: default_text_weight(),
            default_limit: default_limit(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_text_weight() -> f64 {
    0.3
}
fn default_limit() -> usize {
    10
}
fn default_candidate_multiplier() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_concurrent_documents: default_max_concurrent_documents(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    ["docx", "pptx", "xlsx", "pdf", "txt", "md"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}
fn default_max_concurrent_documents() -> usize {
    3
}
fn default_stale_after_secs() -> i64 {
    1800
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.max_chars");
    }
    if config.chunking.chars_per_page == 0 {
        anyhow::bail!("chunking.chars_per_page must be > 0");
    }
    if config.chunking.strategy == ChunkStrategy::Semantic && !config.boundary.is_enabled() {
        anyhow::bail!("chunking.strategy = \"semantic\" requires a [boundary] provider");
    }

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.text_weight) {
        anyhow::bail!("retrieval.text_weight must be in [0.0, 1.0]");
    }
    if config.retrieval.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }

    // Validate embedding
    if !(1..=100).contains(&config.embedding.batch_size) {
        anyhow::bail!("embedding.batch_size must be between 1 and 100");
    }
    if config.embedding.max_concurrent_batches == 0 {
        anyhow::bail!("embedding.max_concurrent_batches must be >= 1");
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.unwrap_or(0) == 0 {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.boundary.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown boundary provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.boundary.is_enabled() && config.boundary.model.is_none() {
        anyhow::bail!("boundary.model must be specified when a boundary provider is set");
    }

    match config.graph.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.graph.url.is_none() {
                anyhow::bail!("graph.url must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown graph provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    if config.graph.chunks_per_episode == 0 || config.graph.max_episode_tokens == 0 {
        anyhow::bail!("graph.chunks_per_episode and graph.max_episode_tokens must be > 0");
    }

    if config.ingestion.max_concurrent_documents == 0 {
        anyhow::bail!("ingestion.max_concurrent_documents must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!("[db]\npath = \"/tmp/kh.sqlite\"\n{}", extra);
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert_eq!(config.chunking.strategy, ChunkStrategy::Fixed);
        assert!((config.retrieval.text_weight - 0.3).abs() < 1e-9);
        assert!(!config.embedding.is_enabled());
        assert!(!config.graph.is_enabled());
        assert_eq!(config.ingestion.max_concurrent_documents, 3);
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let err = parse("[chunking]\nmax_chars = 100\noverlap_chars = 100\n").unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn text_weight_out_of_range_is_rejected() {
        assert!(parse("[retrieval]\ntext_weight = 1.5\n").is_err());
    }

    #[test]
    fn enabled_embedding_requires_dims_and_model() {
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"\ndims = 8\n").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\ndims = 8\n").is_ok());
    }

    #[test]
    fn batch_size_is_bounded() {
        assert!(parse("[embedding]\nbatch_size = 101\n").is_err());
        assert!(parse("[embedding]\nbatch_size = 0\n").is_err());
    }

    #[test]
    fn semantic_strategy_needs_boundary_provider() {
        assert!(parse("[chunking]\nstrategy = \"semantic\"\n").is_err());
        assert!(parse(
            "[chunking]\nstrategy = \"semantic\"\n[boundary]\nprovider = \"ollama\"\nmodel = \"llama3\"\n"
        )
        .is_ok());
    }

    #[test]
    fn http_graph_requires_url() {
        assert!(parse("[graph]\nprovider = \"http\"\n").is_err());
        assert!(parse("[graph]\nprovider = \"http\"\nurl = \"http://localhost:8000\"\n").is_ok());
    }
}
