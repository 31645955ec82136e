//! Section text → retrieval chunks.
//!
//! Two strategies share one output shape ([`ChunkSpan`]):
//! - **fixed**: character windows of `max_chars` with `overlap_chars`
//!   overlap, preferring to break on whitespace. Never fails.
//! - **semantic**: a [`BoundaryProvider`] proposes topic boundaries; an
//!   unusable answer or a failed call falls back to fixed windows.
//!
//! Windows are measured in characters; offsets are recorded in bytes so they
//! slice the section text directly.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::boundary::BoundaryProvider;
use crate::config::{ChunkStrategy, ChunkingConfig};
use crate::models::{Chunk, Citation, Document, SectionRecord, TenantId};
use crate::retry::{with_retry, RetryPolicy};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// One chunk's extent within its section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub text: String,
    /// Byte offsets into the section text.
    pub start: usize,
    pub end: usize,
    /// Character offset of `start`, used for page estimation.
    pub char_start: usize,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Known page wins; otherwise derive it from the character offset.
pub fn page_estimate(known_page: Option<i64>, char_offset: usize, chars_per_page: usize) -> i64 {
    match known_page {
        Some(page) => page,
        None => (char_offset / chars_per_page.max(1)) as i64 + 1,
    }
}

/// Deterministic fixed-window split.
pub fn fixed_window(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<ChunkSpan> {
    let max_chars = max_chars.max(1);
    let overlap = overlap_chars.min(max_chars - 1);
    let bytes: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let byte_at = |i: usize| if i >= n { text.len() } else { bytes[i] };

    let mut spans = Vec::new();
    let mut start = 0usize;
    while start < n {
        let mut end = (start + max_chars).min(n);
        if end < n {
            // Prefer breaking after whitespace in the back half of the window.
            let floor = start + max_chars / 2;
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws + 1;
            }
        }

        let (b_start, b_end) = (byte_at(start), byte_at(end));
        let slice = &text[b_start..b_end];
        if !slice.trim().is_empty() {
            spans.push(ChunkSpan {
                text: slice.to_string(),
                start: b_start,
                end: b_end,
                char_start: start,
            });
        }

        if end >= n {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    spans
}

/// Turn proposed character boundaries into spans. Returns `None` when the
/// proposal is unusable (out of range or not strictly increasing).
pub fn spans_from_boundaries(
    text: &str,
    boundaries: &[usize],
    max_chars: usize,
    overlap_chars: usize,
) -> Option<Vec<ChunkSpan>> {
    let n = text.chars().count();
    let mut previous = 0usize;
    for &b in boundaries {
        if b <= previous || b >= n {
            return None;
        }
        previous = b;
    }

    let bytes: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    let byte_at = |i: usize| if i >= n { text.len() } else { bytes[i] };

    let mut cuts = Vec::with_capacity(boundaries.len() + 2);
    cuts.push(0);
    cuts.extend_from_slice(boundaries);
    cuts.push(n);

    let mut spans = Vec::new();
    for pair in cuts.windows(2) {
        let (c_start, c_end) = (pair[0], pair[1]);
        let (b_start, b_end) = (byte_at(c_start), byte_at(c_end));
        let segment = &text[b_start..b_end];
        if segment.trim().is_empty() {
            continue;
        }
        if c_end - c_start <= max_chars {
            spans.push(ChunkSpan {
                text: segment.to_string(),
                start: b_start,
                end: b_end,
                char_start: c_start,
            });
        } else {
            // Oversized segment: window it, shifting offsets into section space.
            spans.extend(fixed_window(segment, max_chars, overlap_chars).into_iter().map(
                |span| ChunkSpan {
                    start: span.start + b_start,
                    end: span.end + b_start,
                    char_start: span.char_start + c_start,
                    text: span.text,
                },
            ));
        }
    }
    Some(spans)
}

pub struct Chunker {
    config: ChunkingConfig,
    boundary: Option<Arc<dyn BoundaryProvider>>,
    policy: RetryPolicy,
}

impl Chunker {
    pub fn new(
        config: ChunkingConfig,
        boundary: Option<Arc<dyn BoundaryProvider>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            config,
            boundary,
            policy,
        }
    }

    pub fn chars_per_page(&self) -> usize {
        self.config.chars_per_page
    }

    /// Split one section's text into spans using the configured strategy.
    pub async fn split(&self, text: &str) -> Vec<ChunkSpan> {
        let fixed = || fixed_window(text, self.config.max_chars, self.config.overlap_chars);

        let provider = match (&self.config.strategy, &self.boundary) {
            (ChunkStrategy::Semantic, Some(provider)) => provider,
            _ => return fixed(),
        };
        // Short sections gain nothing from a model call.
        if text.chars().count() <= self.config.max_chars {
            return fixed();
        }

        match with_retry("boundary", &self.policy, || provider.propose_boundaries(text)).await {
            Ok(boundaries) => spans_from_boundaries(
                text,
                &boundaries,
                self.config.max_chars,
                self.config.overlap_chars,
            )
            .unwrap_or_else(|| {
                warn!("boundary proposal unusable, falling back to fixed windows");
                fixed()
            }),
            Err(e) => {
                warn!(error = %e, "boundary inference unavailable, falling back to fixed windows");
                fixed()
            }
        }
    }
}

/// Attach identity, citation and page metadata to spans of one section.
pub fn build_chunks(
    tenant: &TenantId,
    document: &Document,
    section: &SectionRecord,
    known_page: Option<i64>,
    section_char_offset: usize,
    chars_per_page: usize,
    spans: Vec<ChunkSpan>,
) -> Vec<Chunk> {
    let citation = Citation {
        document_title: document.title.clone(),
        document_source: document.source_path.clone(),
        category: document.category.clone(),
        document_ordinal: document.ordinal,
    };

    spans
        .into_iter()
        .enumerate()
        .map(|(index, span)| Chunk {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            document_id: document.id.clone(),
            section_id: section.id.clone(),
            section_position: section.position,
            chunk_index: index as i64,
            token_count: estimate_tokens(&span.text) as i64,
            start_offset: span.start as i64,
            end_offset: span.end as i64,
            page_estimate: page_estimate(
                known_page,
                section_char_offset + span.char_start,
                chars_per_page,
            ),
            hash: format!("{:x}", Sha256::digest(span.text.as_bytes())),
            citation: citation.clone(),
            text: span.text,
            embedding: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::time::Duration;

    #[test]
    fn test_small_text_single_chunk() {
        let spans = fixed_window("Hello, world!", 1000, 200);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "Hello, world!");
        assert_eq!((spans[0].start, spans[0].end), (0, 13));
    }

    #[test]
    fn test_empty_text() {
        assert!(fixed_window("", 1000, 200).is_empty());
        assert!(fixed_window("   ", 1000, 200).is_empty());
    }

    #[test]
    fn windows_overlap_and_cover_text() {
        let text = "abcdefghij".repeat(30); // 300 chars, no whitespace
        let spans = fixed_window(&text, 100, 20);
        assert_eq!(spans[0].end, 100);
        assert_eq!(spans[1].start, 80);
        assert_eq!(spans.last().unwrap().end, text.len());
        for span in &spans {
            assert_eq!(&text[span.start..span.end], span.text);
            assert!(span.text.chars().count() <= 100);
        }
    }

    #[test]
    fn prefers_whitespace_breaks() {
        let text = format!("{} {}", "a".repeat(70), "b".repeat(70));
        let spans = fixed_window(&text, 100, 10);
        assert_eq!(spans[0].text, format!("{} ", "a".repeat(70)));
    }

    #[test]
    fn offsets_are_bytes_on_multibyte_text() {
        let text = "é".repeat(150);
        let spans = fixed_window(&text, 100, 0);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].end, 200);
        assert_eq!(spans[1].char_start, 100);
        assert_eq!(&text[spans[1].start..spans[1].end], spans[1].text);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma delta. ".repeat(100);
        assert_eq!(fixed_window(&text, 120, 30), fixed_window(&text, 120, 30));
    }

    #[test]
    fn boundaries_must_increase_within_text() {
        let text = "one two three four";
        assert!(spans_from_boundaries(text, &[4, 8], 100, 10).is_some());
        assert!(spans_from_boundaries(text, &[8, 4], 100, 10).is_none());
        assert!(spans_from_boundaries(text, &[4, 4], 100, 10).is_none());
        assert!(spans_from_boundaries(text, &[0], 100, 10).is_none());
        assert!(spans_from_boundaries(text, &[18], 100, 10).is_none());

        let spans = spans_from_boundaries(text, &[4, 8], 100, 10).unwrap();
        let texts: Vec<&str> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["one ", "two ", "three four"]);
    }

    #[test]
    fn oversized_semantic_segments_are_windowed() {
        let text = format!("{}{}", "x".repeat(10), "y".repeat(250));
        let spans = spans_from_boundaries(&text, &[10], 100, 0).unwrap();
        assert_eq!(spans[0].text, "x".repeat(10));
        assert_eq!(spans[1].start, 10);
        assert!(spans.iter().all(|s| s.text.chars().count() <= 100));
        assert_eq!(spans.last().unwrap().end, text.len());
    }

    #[test]
    fn page_estimate_prefers_known_page() {
        assert_eq!(page_estimate(Some(7), 99_999, 3000), 7);
        assert_eq!(page_estimate(None, 0, 3000), 1);
        assert_eq!(page_estimate(None, 6500, 3000), 3);
    }

    struct FailingBoundary;

    #[async_trait]
    impl BoundaryProvider for FailingBoundary {
        async fn propose_boundaries(&self, _text: &str) -> Result<Vec<usize>, ProviderError> {
            Err(ProviderError::Rejected("model not found".into()))
        }
    }

    struct FixedBoundary(Vec<usize>);

    #[async_trait]
    impl BoundaryProvider for FixedBoundary {
        async fn propose_boundaries(&self, _text: &str) -> Result<Vec<usize>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn semantic(provider: Arc<dyn BoundaryProvider>) -> Chunker {
        let config = ChunkingConfig {
            strategy: ChunkStrategy::Semantic,
            max_chars: 50,
            overlap_chars: 10,
            chars_per_page: 3000,
        };
        let policy = RetryPolicy {
            max_retries: 0,
            timeout: Duration::from_secs(1),
            backoff: Duration::from_millis(1),
        };
        Chunker::new(config, Some(provider), policy)
    }

    #[tokio::test]
    async fn semantic_falls_back_on_failure_or_bad_offsets() {
        let text = "word ".repeat(30);
        let expected = fixed_window(&text, 50, 10);

        assert_eq!(semantic(Arc::new(FailingBoundary)).split(&text).await, expected);
        assert_eq!(
            semantic(Arc::new(FixedBoundary(vec![40, 20]))).split(&text).await,
            expected
        );
    }

    #[tokio::test]
    async fn semantic_uses_valid_boundaries() {
        let text = "word ".repeat(30); // 150 chars
        let spans = semantic(Arc::new(FixedBoundary(vec![50, 100])))
            .split(&text)
            .await;
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].start, 50);
    }
}
