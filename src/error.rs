//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! [`PipelineError`] classifies every failure the pipeline can surface:
//!
//! | Variant | Scope | Retried |
//! |---------|-------|---------|
//! | `Extraction` | whole document | no |
//! | `Transient` | one section | yes, before surfacing |
//! | `Configuration` | whole run | no |
//! | `TenantIsolation` | whole run | no |
//!
//! [`ProviderError`] is what the external capability interfaces
//! (embedding, boundary inference, graph) return for a single call.

use std::time::Duration;

use thiserror::Error;

use crate::models::SectionStatus;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The source file could not be opened or parsed at all.
    #[error("extraction failed for {path}: {message}")]
    Extraction { path: String, message: String },

    /// An external service kept failing after the bounded retry budget.
    #[error("{service} unavailable: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("illegal section transition for {section_id}: {from} -> {to}")]
    InvalidTransition {
        section_id: String,
        from: SectionStatus,
        to: SectionStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ingestion aborted")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Errors that must stop the whole run instead of being recorded on a
    /// single section or document.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::TenantIsolation(_)
                | PipelineError::Store(_)
                | PipelineError::InvalidTransition { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Rate limits, 5xx responses and connection failures.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The request itself was refused (4xx other than 429).
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_) | ProviderError::Timeout(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Unavailable(format!("timeout: {error}"))
        } else if error.is_decode() {
            ProviderError::InvalidResponse(error.to_string())
        } else {
            ProviderError::Unavailable(error.to_string())
        }
    }
}
