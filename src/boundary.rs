//! Semantic boundary inference through a language model.
//!
//! The provider is asked for character offsets at which the text changes
//! topic. Anything it returns is untrusted: validation and the fixed-window
//! fallback live in [`crate::chunk`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BoundaryConfig;
use crate::embedding::read_json;
use crate::error::ProviderError;

const PROMPT: &str = "Split the text below into topically coherent segments for retrieval. \
Respond only with JSON of the form {\"boundaries\": [n, ...]} where each n is the character \
offset (0-based, counted in Unicode characters) at which a new segment starts. Do not include 0.\n\nTEXT:\n";

#[async_trait]
pub trait BoundaryProvider: Send + Sync {
    /// Character offsets where new segments begin.
    async fn propose_boundaries(&self, text: &str) -> Result<Vec<usize>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    OpenAI,
    Ollama,
}

/// Chat-completion backed provider (OpenAI-compatible or Ollama).
pub struct LlmBoundaryProvider {
    dialect: Dialect,
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmBoundaryProvider {
    pub fn new(config: &BoundaryConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("boundary.model required"))?;
        let (dialect, default_url, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
                (Dialect::OpenAI, "https://api.openai.com/v1", Some(key))
            }
            "ollama" => (Dialect::Ollama, "http://localhost:11434", None),
            other => bail!("Unknown boundary provider: {}", other),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            dialect,
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string()),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl BoundaryProvider for LlmBoundaryProvider {
    async fn propose_boundaries(&self, text: &str) -> Result<Vec<usize>, ProviderError> {
        let messages = serde_json::json!([
            {"role": "user", "content": format!("{}{}", PROMPT, text)}
        ]);
        let base = self.url.trim_end_matches('/');

        let content = match self.dialect {
            Dialect::OpenAI => {
                let body = serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "temperature": 0,
                    "response_format": {"type": "json_object"},
                });
                let mut request = self.client.post(format!("{}/chat/completions", base)).json(&body);
                if let Some(key) = &self.api_key {
                    request = request.header("Authorization", format!("Bearer {}", key));
                }
                let json = read_json("OpenAI", request.send().await?).await?;
                json.pointer("/choices/0/message/content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
            }
            Dialect::Ollama => {
                let body = serde_json::json!({
                    "model": self.model,
                    "messages": messages,
                    "stream": false,
                    "format": "json",
                });
                let response = self
                    .client
                    .post(format!("{}/api/chat", base))
                    .json(&body)
                    .send()
                    .await?;
                let json = read_json("Ollama", response).await?;
                json.pointer("/message/content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
            }
        };

        let content = content
            .ok_or_else(|| ProviderError::InvalidResponse("missing message content".to_string()))?;
        parse_boundaries(&content)
    }
}

/// Extract `{"boundaries": [...]}` from a model reply, tolerating prose
/// around the JSON object.
pub fn parse_boundaries(content: &str) -> Result<Vec<usize>, ProviderError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let object = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => return Err(ProviderError::InvalidResponse("no JSON object in reply".to_string())),
    };
    let json: serde_json::Value = serde_json::from_str(object)
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let values = json
        .get("boundaries")
        .and_then(|b| b.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing boundaries array".to_string()))?;

    values
        .iter()
        .map(|v| {
            v.as_u64().map(|n| n as usize).ok_or_else(|| {
                ProviderError::InvalidResponse("boundary is not a non-negative integer".to_string())
            })
        })
        .collect()
}

pub fn create_boundary_provider(config: &BoundaryConfig) -> Result<Option<Arc<dyn BoundaryProvider>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(LlmBoundaryProvider::new(config)?)))
}
