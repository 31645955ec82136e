//! Core data models used throughout Knowledge Harness.
//!
//! These types represent the tenants, documents, ingestion records, sections
//! and chunks that flow through the ingestion and retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::PipelineError;

const MAX_TENANT_ID_LEN: usize = 64;

/// Isolation boundary for every stored row and every query.
///
/// Only constructible through [`TenantId::parse`], so an empty or malformed
/// tenant can never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::TenantIsolation(
                "tenant id is required".to_string(),
            ));
        }
        if trimmed.len() > MAX_TENANT_ID_LEN {
            return Err(PipelineError::TenantIsolation(format!(
                "tenant id exceeds {} characters",
                MAX_TENANT_ID_LEN
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PipelineError::TenantIsolation(format!(
                "tenant id contains invalid characters: {}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Fixed tenant for local development and tests. Not compiled into
    /// production builds.
    #[cfg(any(test, feature = "dev-default-tenant"))]
    pub fn development() -> Self {
        Self("dev".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decision made by the scanner for one candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanAction {
    Ingest,
    Skip,
    Reingest,
    CleanupAndReingest,
}

impl fmt::Display for ScanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanAction::Ingest => "INGEST",
            ScanAction::Skip => "SKIP",
            ScanAction::Reingest => "REINGEST",
            ScanAction::CleanupAndReingest => "CLEANUP_AND_REINGEST",
        };
        f.write_str(label)
    }
}

/// Document-level ingestion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Partial => "partial",
        }
    }

    /// Derive the document status from the outcome of its sections.
    ///
    /// Sections left `pending` (e.g. after an aborted run) count as not
    /// completed.
    pub fn from_sections(statuses: &[SectionStatus]) -> Self {
        if statuses.is_empty() {
            return DocumentStatus::Completed;
        }
        let completed = statuses
            .iter()
            .filter(|s| **s == SectionStatus::Completed)
            .count();
        if completed == statuses.len() {
            DocumentStatus::Completed
        } else if completed == 0 {
            DocumentStatus::Failed
        } else {
            DocumentStatus::Partial
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            "partial" => Ok(DocumentStatus::Partial),
            other => Err(PipelineError::NotFound(format!(
                "unknown document status '{}'",
                other
            ))),
        }
    }
}

/// Section-level ingestion state; the unit of retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionStatus::Pending => "pending",
            SectionStatus::Processing => "processing",
            SectionStatus::Completed => "completed",
            SectionStatus::Failed => "failed",
        }
    }

    /// Legal moves: `pending -> processing -> {completed, failed}`.
    ///
    /// The reset `failed -> pending` is not a transition; it is only
    /// performed by the cleanup operation.
    pub fn can_transition_to(&self, next: SectionStatus) -> bool {
        matches!(
            (self, next),
            (SectionStatus::Pending, SectionStatus::Processing)
                | (SectionStatus::Processing, SectionStatus::Completed)
                | (SectionStatus::Processing, SectionStatus::Failed)
        )
    }
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SectionStatus::Pending),
            "processing" => Ok(SectionStatus::Processing),
            "completed" => Ok(SectionStatus::Completed),
            "failed" => Ok(SectionStatus::Failed),
            other => Err(PipelineError::NotFound(format!(
                "unknown section status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Heading,
    Paragraph,
    Table,
    ListItem,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Heading => "heading",
            SectionKind::Paragraph => "paragraph",
            SectionKind::Table => "table",
            SectionKind::ListItem => "list_item",
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heading" => Ok(SectionKind::Heading),
            "paragraph" => Ok(SectionKind::Paragraph),
            "table" => Ok(SectionKind::Table),
            "list_item" => Ok(SectionKind::ListItem),
            other => Err(PipelineError::NotFound(format!(
                "unknown section kind '{}'",
                other
            ))),
        }
    }
}

/// One successfully ingested source file.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: TenantId,
    pub title: String,
    pub source_path: String,
    pub category: String,
    pub ordinal: i64,
    pub content_hash: String,
    pub size_bytes: i64,
    pub word_count: i64,
    pub page_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Authoritative per-file ingestion record, keyed by `(tenant, path)`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub id: String,
    pub tenant_id: TenantId,
    pub path: String,
    pub document_id: Option<String>,
    pub file_hash: String,
    pub file_size: i64,
    pub modified_at: i64,
    pub status: DocumentStatus,
    pub chunks_created: i64,
    pub entities_extracted: i64,
    pub episodes_created: i64,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

/// Tracked structural unit inside one ingestion record.
#[derive(Debug, Clone, Serialize)]
pub struct SectionRecord {
    pub id: String,
    pub tenant_id: TenantId,
    pub ingestion_status_id: String,
    pub position: i64,
    pub kind: SectionKind,
    pub content_hash: String,
    pub content_length: i64,
    pub preview: String,
    pub status: SectionStatus,
    pub chunks_created: i64,
    pub entities_extracted: i64,
    pub episodes_created: i64,
    pub error_message: Option<String>,
    pub graph_error: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

/// Citation fields copied onto every chunk so results need no join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub document_title: String,
    pub document_source: String,
    pub category: String,
    pub document_ordinal: i64,
}

/// A retrieval unit: a span of one section's text plus its embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub tenant_id: TenantId,
    pub document_id: String,
    pub section_id: String,
    pub section_position: i64,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    /// Byte offsets into the parent section's content.
    pub start_offset: i64,
    pub end_offset: i64,
    pub page_estimate: i64,
    pub hash: String,
    pub citation: Citation,
    pub embedding: Option<Vec<f32>>,
}

/// Row of the operator-facing recovery report.
#[derive(Debug, Clone, Serialize)]
pub struct FailedSectionSummary {
    pub ingestion_status_id: String,
    pub document_path: String,
    pub document_title: Option<String>,
    pub category: Option<String>,
    pub section_id: String,
    pub position: i64,
    pub kind: SectionKind,
    pub status: SectionStatus,
    /// True when the section is stuck in `processing` past the threshold.
    pub stale: bool,
    pub error_message: Option<String>,
    pub preview: String,
    pub updated_at: i64,
}
