//! Ingestion orchestration.
//!
//! Drives one file through: classify → open status → extract → commit the
//! new version (superseding the old one) → record sections → (per pending
//! section) chunk → embed → store → graph → roll the section outcomes up
//! into the document status.
//!
//! Sections are processed in position order and are the unit of retry: a
//! section failure is recorded and its siblings carry on. Only
//! configuration, tenant-isolation and store errors abort the run.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::boundary::create_boundary_provider;
use crate::chunk::{build_chunks, Chunker};
use crate::config::{Config, IngestionConfig};
use crate::embedding::{create_provider, Embedder};
use crate::error::{PipelineError, Result};
use crate::extract::{extract_sections, ExtractedSection};
use crate::graph::{create_graph_service, GraphSubmitter};
use crate::models::{
    Chunk, Document, DocumentStatus, FailedSectionSummary, IngestionStatus, ScanAction,
    SectionRecord, SectionStatus, TenantId,
};
use crate::scan::{classify, fingerprint, walk_tree, Fingerprint, SourceFile};
use crate::store::{DocumentDraft, KnowledgeStore, NewSection};

/// Operator abort signal, checked between sections.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A file with its scan decision.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub file: SourceFile,
    pub fingerprint: Fingerprint,
    pub existing: Option<IngestionStatus>,
    pub action: ScanAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub path: String,
    pub message: String,
}

/// Result of a tree ingestion run.
#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub ingested: usize,
    pub reingested: usize,
    pub recovered: usize,
    pub skipped: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: Vec<DocumentFailure>,
    pub aborted: bool,
}

pub struct Pipeline {
    store: KnowledgeStore,
    embedder: Arc<Embedder>,
    chunker: Arc<Chunker>,
    graph: Arc<GraphSubmitter>,
    ingestion: IngestionConfig,
    cancel: CancellationFlag,
}

impl Pipeline {
    pub fn new(
        store: KnowledgeStore,
        embedder: Arc<Embedder>,
        chunker: Arc<Chunker>,
        graph: Arc<GraphSubmitter>,
        ingestion: IngestionConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            graph,
            ingestion,
            cancel: CancellationFlag::new(),
        }
    }

    /// Build the pipeline and its providers from configuration.
    pub fn from_config(config: &Config, store: KnowledgeStore) -> anyhow::Result<Self> {
        let embedder = Arc::new(Embedder::new(
            create_provider(&config.embedding)?,
            &config.embedding,
        ));
        let chunker = Arc::new(Chunker::new(
            config.chunking.clone(),
            create_boundary_provider(&config.boundary)?,
            config.boundary.retry_policy(),
        ));
        let graph = Arc::new(GraphSubmitter::new(
            create_graph_service(&config.graph)?,
            &config.graph,
        ));
        Ok(Self::new(
            store,
            embedder,
            chunker,
            graph,
            config.ingestion.clone(),
        ))
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn graph(&self) -> &Arc<GraphSubmitter> {
        &self.graph
    }

    fn plan_file(&self, existing: Option<IngestionStatus>, file: SourceFile) -> Result<PlannedFile> {
        let fingerprint = fingerprint(&file.abs_path)?;
        let action = classify(existing.as_ref(), &fingerprint.hash);
        Ok(PlannedFile {
            file,
            fingerprint,
            existing,
            action,
        })
    }

    /// Walk `root` and classify every candidate file. Read-only.
    pub async fn plan(&self, tenant: &TenantId, root: &Path) -> Result<Vec<PlannedFile>> {
        let files = walk_tree(root, &self.ingestion)?;
        let mut planned = Vec::with_capacity(files.len());
        for file in files {
            let existing = self.store.get_status_by_path(tenant, &file.rel_path).await?;
            planned.push(self.plan_file(existing, file)?);
        }
        Ok(planned)
    }

    pub async fn scan_and_classify(
        &self,
        tenant: &TenantId,
        root: &Path,
    ) -> Result<BTreeMap<String, ScanAction>> {
        Ok(self
            .plan(tenant, root)
            .await?
            .into_iter()
            .map(|p| (p.file.rel_path, p.action))
            .collect())
    }

    /// Ingest one file. `path` is absolute or relative to `root`; the
    /// root-relative path is the document's key.
    pub async fn ingest_document(
        &self,
        tenant: &TenantId,
        root: &Path,
        path: &Path,
    ) -> Result<IngestionStatus> {
        let file = SourceFile::resolve(root, path)?;
        let existing = self.store.get_status_by_path(tenant, &file.rel_path).await?;
        let planned = self.plan_file(existing, file)?;
        self.process_file(tenant, &planned).await
    }

    /// Scan `root` and ingest every non-`SKIP` file, at most
    /// `max_concurrent_documents` at a time.
    pub async fn ingest_tree(&self, tenant: &TenantId, root: &Path) -> Result<IngestSummary> {
        let planned = self.plan(tenant, root).await?;
        let mut summary = IngestSummary::default();

        let semaphore = Arc::new(Semaphore::new(self.ingestion.max_concurrent_documents.max(1)));

        let mut work = Vec::new();
        for plan in &planned {
            match plan.action {
                ScanAction::Skip => {
                    summary.skipped += 1;
                    continue;
                }
                ScanAction::Ingest => summary.ingested += 1,
                ScanAction::Reingest => summary.reingested += 1,
                ScanAction::CleanupAndReingest => summary.recovered += 1,
            }

            let sem = semaphore.clone();
            work.push(async move {
                let result = match sem.acquire().await {
                    Ok(_permit) => self.process_file(tenant, plan).await,
                    Err(_) => Err(PipelineError::Cancelled),
                };
                (plan.file.rel_path.clone(), result)
            });
        }

        let results = join_all(work).await;

        let mut fatal = None;
        for (path, result) in results {
            match result {
                Ok(status) => match status.status {
                    DocumentStatus::Completed => summary.completed += 1,
                    DocumentStatus::Partial => summary.partial += 1,
                    _ => summary.failed.push(DocumentFailure {
                        path,
                        message: status.error_message.unwrap_or_default(),
                    }),
                },
                Err(PipelineError::Cancelled) => summary.aborted = true,
                Err(e) if e.is_fatal() => {
                    error!(tenant = %tenant, path = %path, error = %e, "fatal ingestion error");
                    fatal.get_or_insert(e);
                }
                Err(e) => summary.failed.push(DocumentFailure {
                    path,
                    message: e.to_string(),
                }),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        info!(
            tenant = %tenant,
            completed = summary.completed,
            partial = summary.partial,
            failed = summary.failed.len(),
            skipped = summary.skipped,
            "ingestion run finished"
        );
        Ok(summary)
    }

    /// Reset a document's failed sections to `pending`, dropping only their
    /// chunks.
    pub async fn cleanup_failed_sections(
        &self,
        tenant: &TenantId,
        ingestion_status_id: &str,
    ) -> Result<u64> {
        let reset = self
            .store
            .cleanup_failed_sections(tenant, ingestion_status_id)
            .await?;
        self.store
            .refresh_status_counts(tenant, ingestion_status_id)
            .await?;
        info!(tenant = %tenant, status = ingestion_status_id, reset, "failed sections reset");
        Ok(reset)
    }

    pub async fn recovery_report(&self, tenant: &TenantId) -> Result<Vec<FailedSectionSummary>> {
        let stale_before = chrono::Utc::now().timestamp() - self.ingestion.stale_after_secs;
        self.store.recovery_report(tenant, stale_before).await
    }

    pub async fn list_statuses(&self, tenant: &TenantId) -> Result<Vec<IngestionStatus>> {
        self.store.list_statuses(tenant).await
    }

    pub async fn get_chunks(&self, tenant: &TenantId, document_id: &str) -> Result<Vec<Chunk>> {
        self.store.get_chunks(tenant, document_id).await
    }

    async fn process_file(&self, tenant: &TenantId, plan: &PlannedFile) -> Result<IngestionStatus> {
        let rel_path = plan.file.rel_path.as_str();
        if plan.action == ScanAction::Skip {
            if let Some(existing) = &plan.existing {
                info!(tenant = %tenant, path = rel_path, "unchanged, skipping");
                return Ok(existing.clone());
            }
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.store.ensure_tenant(tenant).await?;
        let fp = &plan.fingerprint;
        let status = self
            .store
            .open_status(tenant, rel_path, &fp.hash, fp.size, fp.modified_at)
            .await?;

        if plan.action == ScanAction::CleanupAndReingest {
            let interrupted = self
                .store
                .fail_processing_sections(tenant, &status.id, "interrupted")
                .await?;
            if interrupted > 0 {
                warn!(tenant = %tenant, path = rel_path, interrupted, "recovering interrupted sections");
            }
            self.store.cleanup_failed_sections(tenant, &status.id).await?;
        }

        self.store
            .set_document_status(tenant, &status.id, DocumentStatus::Processing, None, None)
            .await?;
        info!(tenant = %tenant, path = rel_path, action = %plan.action, "ingesting");

        let abs_path = plan.file.abs_path.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_sections(&abs_path))
            .await
            .map_err(|e| PipelineError::Extraction {
                path: rel_path.to_string(),
                message: e.to_string(),
            })
            .and_then(|r| {
                r.map_err(|e| PipelineError::Extraction {
                    path: rel_path.to_string(),
                    message: e.to_string(),
                })
            });

        let sections = match extracted {
            Ok(sections) => sections,
            Err(e) => {
                // The previous version, if any, stays in place and searchable.
                warn!(tenant = %tenant, path = rel_path, error = %e, "extraction failed");
                self.store
                    .set_document_status(
                        tenant,
                        &status.id,
                        DocumentStatus::Failed,
                        Some(&e.to_string()),
                        Some("extraction"),
                    )
                    .await?;
                return self.store.get_status(tenant, &status.id).await;
            }
        };

        let supersede = plan.action == ScanAction::Reingest;
        let document = self
            .store
            .stage_document(
                tenant,
                &status,
                &DocumentDraft {
                    source_path: rel_path.to_string(),
                    title: plan.file.title(),
                    category: plan.file.category(),
                    content_hash: fp.hash.clone(),
                    size_bytes: fp.size,
                    word_count: sections
                        .iter()
                        .map(|s| s.text.split_whitespace().count() as i64)
                        .sum(),
                    page_count: page_count(&sections, self.chunker.chars_per_page()),
                },
                fp.modified_at,
                supersede,
            )
            .await?;
        if supersede {
            info!(tenant = %tenant, path = rel_path, "content changed, previous version superseded");
        }

        let outcome = self
            .process_sections(tenant, &status.id, &document, &sections, fp.modified_at)
            .await;

        if self.cancel.is_cancelled() {
            self.store
                .fail_processing_sections(tenant, &status.id, "aborted")
                .await?;
        }
        let final_status = self.finalize(tenant, &status.id).await?;

        match outcome {
            Ok(()) if self.cancel.is_cancelled() && final_status.status != DocumentStatus::Completed => {
                Err(PipelineError::Cancelled)
            }
            Ok(()) => Ok(final_status),
            Err(e) => {
                if e.is_fatal() {
                    // Stop sibling documents between sections.
                    self.cancel.cancel();
                }
                Err(e)
            }
        }
    }

    async fn process_sections(
        &self,
        tenant: &TenantId,
        status_id: &str,
        document: &Document,
        sections: &[ExtractedSection],
        file_modified_at: i64,
    ) -> Result<()> {
        for section in sections {
            self.store
                .record_section(
                    tenant,
                    status_id,
                    &NewSection {
                        position: section.position,
                        kind: section.kind,
                        content_hash: section.content_hash(),
                        content_length: section.text.len() as i64,
                        preview: section.preview(),
                    },
                )
                .await?;
        }

        let records: BTreeMap<i64, SectionRecord> = self
            .store
            .list_sections(tenant, status_id)
            .await?
            .into_iter()
            .map(|r| (r.position, r))
            .collect();

        let mut char_offset = 0usize;
        for section in sections {
            let section_chars = section.text.chars().count();
            let offset = char_offset;
            char_offset += section_chars;

            let Some(record) = records.get(&section.position) else {
                continue;
            };
            if record.status == SectionStatus::Completed {
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!(tenant = %tenant, status = status_id, "cancelled between sections");
                return Ok(());
            }

            self.process_section(tenant, document, record, section, offset, file_modified_at)
                .await?;
        }
        Ok(())
    }

    async fn process_section(
        &self,
        tenant: &TenantId,
        document: &Document,
        record: &SectionRecord,
        section: &ExtractedSection,
        char_offset: usize,
        file_modified_at: i64,
    ) -> Result<()> {
        self.store
            .transition_section(tenant, &record.id, SectionStatus::Processing, None)
            .await?;

        let spans = self.chunker.split(&section.text).await;
        let mut chunks = build_chunks(
            tenant,
            document,
            record,
            section.page,
            char_offset,
            self.chunker.chars_per_page(),
            spans,
        );

        if self.embedder.is_enabled() && !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed_texts(tenant, &texts).await {
                Ok(vectors) => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.embedding = Some(vector);
                    }
                }
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        document = %document.source_path,
                        section = record.position,
                        error = %e,
                        "section failed"
                    );
                    self.store
                        .transition_section(
                            tenant,
                            &record.id,
                            SectionStatus::Failed,
                            Some(&e.to_string()),
                        )
                        .await?;
                    return if e.is_fatal() { Err(e) } else { Ok(()) };
                }
            }
        }

        self.store.complete_section(tenant, &record.id, &chunks).await?;

        let outcome = self
            .graph
            .submit_section(tenant, document, record, &chunks, file_modified_at)
            .await;
        self.store
            .record_graph_outcome(
                tenant,
                &record.id,
                outcome.episodes_created,
                outcome.entities_extracted,
                outcome.error.as_deref(),
            )
            .await?;
        Ok(())
    }

    /// Derive the document status from its sections and roll counts up.
    async fn finalize(&self, tenant: &TenantId, status_id: &str) -> Result<IngestionStatus> {
        let sections = self.store.list_sections(tenant, status_id).await?;
        let statuses: Vec<SectionStatus> = sections.iter().map(|s| s.status).collect();
        let doc_status = DocumentStatus::from_sections(&statuses);

        let failed: Vec<&SectionRecord> = sections
            .iter()
            .filter(|s| s.status != SectionStatus::Completed)
            .collect();
        let message = (!failed.is_empty()).then(|| {
            format!(
                "{} of {} sections not completed (first: position {}: {})",
                failed.len(),
                sections.len(),
                failed[0].position,
                failed[0].error_message.as_deref().unwrap_or("pending")
            )
        });

        self.store.refresh_status_counts(tenant, status_id).await?;
        self.store
            .set_document_status(tenant, status_id, doc_status, message.as_deref(), None)
            .await?;
        self.store.get_status(tenant, status_id).await
    }
}

fn page_count(sections: &[ExtractedSection], chars_per_page: usize) -> i64 {
    let known = sections.iter().filter_map(|s| s.page).max();
    match known {
        Some(pages) => pages,
        None => {
            let chars: usize = sections.iter().map(|s| s.text.chars().count()).sum();
            chars.div_ceil(chars_per_page.max(1)) as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SectionKind;

    fn section(text: &str, page: Option<i64>) -> ExtractedSection {
        ExtractedSection {
            position: 1,
            kind: SectionKind::Paragraph,
            text: text.to_string(),
            page,
        }
    }

    #[test]
    fn page_count_uses_known_pages_or_estimate() {
        assert_eq!(page_count(&[section("a", Some(3)), section("b", Some(5))], 3000), 5);
        assert_eq!(page_count(&[section(&"x".repeat(3001), None)], 3000), 2);
        assert_eq!(page_count(&[], 3000), 0);
    }

    #[test]
    fn cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
