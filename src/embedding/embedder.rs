use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::models::TenantId;
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant: String,
    model: String,
    text_hash: String,
}

/// Bounded FIFO cache of embeddings, keyed by tenant as well as content so
/// one tenant's text never answers another tenant's lookup.
struct EmbeddingCache {
    capacity: usize,
    entries: HashMap<CacheKey, Vec<f32>>,
    order: VecDeque<CacheKey>,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, vector: Vec<f32>) {
        if self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, vector);
    }
}

/// Batched, retried, dimension-checked access to an [`EmbeddingProvider`].
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_concurrent_batches: usize,
    policy: RetryPolicy,
    cache: Option<Mutex<EmbeddingCache>>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self::with_policy(provider, config, config.retry_policy())
    }

    pub fn with_policy(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        policy: RetryPolicy,
    ) -> Self {
        let cache = (config.cache_capacity > 0)
            .then(|| Mutex::new(EmbeddingCache::new(config.cache_capacity)));
        Self {
            provider,
            batch_size: config.batch_size.clamp(1, 100),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            policy,
            cache,
        }
    }

    /// False for the disabled provider: chunks are stored without vectors
    /// and queries fall back to lexical ranking.
    pub fn is_enabled(&self) -> bool {
        self.provider.dims() > 0
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    fn cache_key(&self, tenant: &TenantId, text: &str) -> CacheKey {
        CacheKey {
            tenant: tenant.as_str().to_string(),
            model: self.provider.model_name().to_string(),
            text_hash: hex::encode(Sha256::digest(text.as_bytes())),
        }
    }

    /// Embed `texts` and return vectors in input order.
    ///
    /// Misses are sent in batches of at most `batch_size`, with up to
    /// `max_concurrent_batches` in flight. A batch that still fails after
    /// retries fails the whole call; a wrong dimensionality is a
    /// configuration error.
    pub async fn embed_texts(&self, tenant: &TenantId, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<CacheKey> = texts.iter().map(|t| self.cache_key(tenant, t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = match &self.cache {
            Some(cache) => {
                let cache = lock(cache);
                keys.iter().map(|k| cache.get(k)).collect()
            }
            None => vec![None; texts.len()],
        };

        let misses: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        if !misses.is_empty() {
            debug!(
                tenant = %tenant,
                total = texts.len(),
                misses = misses.len(),
                "embedding texts"
            );
        }

        let batches: Vec<Vec<usize>> = misses
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();

        // `buffered` yields in submission order, so batch results line up
        // with `batches` regardless of completion order.
        let embedded: Vec<(Vec<usize>, Vec<Vec<f32>>)> = stream::iter(batches)
            .map(|indices| async move {
                let batch: Vec<String> = indices.iter().map(|&i| texts[i].clone()).collect();
                let vectors = self.embed_batch(&batch).await?;
                Ok::<_, PipelineError>((indices, vectors))
            })
            .buffered(self.max_concurrent_batches)
            .try_collect()
            .await?;

        for (indices, vectors) in embedded {
            for (i, vector) in indices.into_iter().zip(vectors) {
                if let Some(cache) = &self.cache {
                    lock(cache).insert(keys[i].clone(), vector.clone());
                }
                results[i] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| PipelineError::Transient {
                    service: "embedding",
                    message: "provider returned too few vectors".to_string(),
                })
            })
            .collect()
    }

    pub async fn embed_query(&self, tenant: &TenantId, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(tenant, &[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| PipelineError::Transient {
            service: "embedding",
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = with_retry("embedding", &self.policy, || self.provider.embed(batch))
            .await
            .map_err(|e| PipelineError::Transient {
                service: "embedding",
                message: e.to_string(),
            })?;

        if vectors.len() != batch.len() {
            return Err(PipelineError::Transient {
                service: "embedding",
                message: format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                ),
            });
        }

        let expected = self.provider.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(PipelineError::Configuration(format!(
                "embedding dimension mismatch for model {}: configured {}, provider returned {}",
                self.provider.model_name(),
                expected,
                bad.len()
            )));
        }

        Ok(vectors)
    }
}

fn lock(cache: &Mutex<EmbeddingCache>) -> std::sync::MutexGuard<'_, EmbeddingCache> {
    // The cache holds no invariants a panicking writer could break.
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
