use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::chunks::insert_chunk;
use super::{check_owner, fts_table, now, KnowledgeStore};
use crate::error::{PipelineError, Result};
use crate::models::{
    Chunk, FailedSectionSummary, SectionKind, SectionRecord, SectionStatus, TenantId,
};

/// Section as discovered by the extractor, before it has an id.
#[derive(Debug, Clone)]
pub struct NewSection {
    pub position: i64,
    pub kind: SectionKind,
    pub content_hash: String,
    pub content_length: i64,
    pub preview: String,
}

fn section_from_row(tenant: &TenantId, row: &SqliteRow) -> Result<SectionRecord> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(SectionRecord {
        id: row.get("id"),
        tenant_id: tenant.clone(),
        ingestion_status_id: row.get("ingestion_status_id"),
        position: row.get("position"),
        kind: kind.parse()?,
        content_hash: row.get("content_hash"),
        content_length: row.get("content_length"),
        preview: row.get("preview"),
        status: status.parse()?,
        chunks_created: row.get("chunks_created"),
        entities_extracted: row.get("entities_extracted"),
        episodes_created: row.get("episodes_created"),
        error_message: row.get("error_message"),
        graph_error: row.get("graph_error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Remove a set of sections' chunks together with their lexical index rows.
async fn delete_section_chunks(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &TenantId,
    section_filter: &str,
    key: &str,
) -> Result<u64> {
    sqlx::query(&format!(
        "DELETE FROM {} WHERE chunk_id IN \
         (SELECT id FROM chunks WHERE tenant_id = ?1 AND section_id IN ({}))",
        fts_table(tenant),
        section_filter
    ))
    .bind(tenant.as_str())
    .bind(key)
    .execute(&mut **tx)
    .await?;

    let deleted = sqlx::query(&format!(
        "DELETE FROM chunks WHERE tenant_id = ?1 AND section_id IN ({})",
        section_filter
    ))
    .bind(tenant.as_str())
    .bind(key)
    .execute(&mut **tx)
    .await?;

    Ok(deleted.rows_affected())
}

/// Drop every section and chunk of a superseded document version.
pub(super) async fn delete_document_content(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &TenantId,
    ingestion_status_id: &str,
    document_id: Option<&str>,
) -> Result<u64> {
    let mut removed = delete_section_chunks(
        tx,
        tenant,
        "SELECT id FROM sections WHERE tenant_id = ?1 AND ingestion_status_id = ?2",
        ingestion_status_id,
    )
    .await?;

    if let Some(doc_id) = document_id {
        sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", fts_table(tenant)))
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
        removed += sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND document_id = ?")
            .bind(tenant.as_str())
            .bind(doc_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
    }

    sqlx::query("DELETE FROM sections WHERE tenant_id = ? AND ingestion_status_id = ?")
        .bind(tenant.as_str())
        .bind(ingestion_status_id)
        .execute(&mut **tx)
        .await?;

    Ok(removed)
}

impl KnowledgeStore {
    /// Record a discovered section. Idempotent per `(status, position)`:
    /// re-recording returns the existing id and leaves its state alone.
    pub async fn record_section(
        &self,
        tenant: &TenantId,
        ingestion_status_id: &str,
        section: &NewSection,
    ) -> Result<String> {
        sqlx::query(
            r#"
            INSERT INTO sections (id, tenant_id, ingestion_status_id, position, kind,
                                  content_hash, content_length, preview, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(ingestion_status_id, position) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(tenant.as_str())
        .bind(ingestion_status_id)
        .bind(section.position)
        .bind(section.kind.as_str())
        .bind(&section.content_hash)
        .bind(section.content_length)
        .bind(&section.preview)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, tenant_id FROM sections WHERE ingestion_status_id = ? AND position = ?",
        )
        .bind(ingestion_status_id)
        .bind(section.position)
        .fetch_one(&self.pool)
        .await?;

        let id: String = row.get("id");
        let owner: String = row.get("tenant_id");
        check_owner(tenant, &owner, "section", &id)?;
        Ok(id)
    }

    pub async fn get_section(&self, tenant: &TenantId, id: &str) -> Result<SectionRecord> {
        let row = sqlx::query("SELECT * FROM sections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("section {}", id)))?;

        let owner: String = row.get("tenant_id");
        check_owner(tenant, &owner, "section", id)?;
        section_from_row(tenant, &row)
    }

    pub async fn list_sections(
        &self,
        tenant: &TenantId,
        ingestion_status_id: &str,
    ) -> Result<Vec<SectionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM sections WHERE tenant_id = ? AND ingestion_status_id = ? ORDER BY position",
        )
        .bind(tenant.as_str())
        .bind(ingestion_status_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| section_from_row(tenant, r)).collect()
    }

    /// Apply one legal state-machine move. Moves to `completed` go through
    /// [`KnowledgeStore::complete_section`] so chunks land atomically.
    pub async fn transition_section(
        &self,
        tenant: &TenantId,
        section_id: &str,
        to: SectionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let current = self.get_section(tenant, section_id).await?;
        if !current.status.can_transition_to(to) || to == SectionStatus::Completed {
            return Err(PipelineError::InvalidTransition {
                section_id: section_id.to_string(),
                from: current.status,
                to,
            });
        }

        let ts = now();
        let result = match to {
            SectionStatus::Processing => {
                sqlx::query(
                    r#"
                    UPDATE sections SET status = 'processing', error_message = NULL,
                        started_at = ?, completed_at = NULL, updated_at = ?
                    WHERE tenant_id = ? AND id = ? AND status = ?
                    "#,
                )
                .bind(ts)
                .bind(ts)
                .bind(tenant.as_str())
                .bind(section_id)
                .bind(current.status.as_str())
                .execute(&self.pool)
                .await?
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE sections SET status = ?, error_message = ?,
                        completed_at = ?, updated_at = ?
                    WHERE tenant_id = ? AND id = ? AND status = ?
                    "#,
                )
                .bind(to.as_str())
                .bind(error)
                .bind(ts)
                .bind(ts)
                .bind(tenant.as_str())
                .bind(section_id)
                .bind(current.status.as_str())
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            let now_status = self.get_section(tenant, section_id).await?.status;
            return Err(PipelineError::InvalidTransition {
                section_id: section_id.to_string(),
                from: now_status,
                to,
            });
        }
        Ok(())
    }

    /// Replace the section's chunks and mark it `completed` in one
    /// transaction. A crash before commit leaves the section `processing`
    /// with its previous chunk set.
    pub async fn complete_section(
        &self,
        tenant: &TenantId,
        section_id: &str,
        chunks: &[Chunk],
    ) -> Result<()> {
        if let Some(stray) = chunks
            .iter()
            .find(|c| &c.tenant_id != tenant || c.section_id != section_id)
        {
            return Err(PipelineError::TenantIsolation(format!(
                "chunk {} does not belong to section {} of tenant {}",
                stray.id, section_id, tenant
            )));
        }

        let mut tx = self.pool.begin().await?;

        delete_section_chunks(&mut tx, tenant, "?2", section_id).await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        let ts = now();
        let updated = sqlx::query(
            r#"
            UPDATE sections SET status = 'completed', chunks_created = ?, error_message = NULL,
                completed_at = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ? AND status = 'processing'
            "#,
        )
        .bind(chunks.len() as i64)
        .bind(ts)
        .bind(ts)
        .bind(tenant.as_str())
        .bind(section_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM sections WHERE tenant_id = ? AND id = ?")
                    .bind(tenant.as_str())
                    .bind(section_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            let from = match status {
                Some(s) => s.parse()?,
                None => return Err(PipelineError::NotFound(format!("section {}", section_id))),
            };
            return Err(PipelineError::InvalidTransition {
                section_id: section_id.to_string(),
                from,
                to: SectionStatus::Completed,
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// Graph enrichment outcome. Never changes the section status.
    pub async fn record_graph_outcome(
        &self,
        tenant: &TenantId,
        section_id: &str,
        episodes_created: i64,
        entities_extracted: i64,
        graph_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sections SET episodes_created = ?, entities_extracted = ?, graph_error = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ?
            "#,
        )
        .bind(episodes_created)
        .bind(entities_extracted)
        .bind(graph_error)
        .bind(now())
        .bind(tenant.as_str())
        .bind(section_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move every section of a document still in `processing` to `failed`.
    /// Used for interrupted runs and cancellation.
    pub async fn fail_processing_sections(
        &self,
        tenant: &TenantId,
        ingestion_status_id: &str,
        message: &str,
    ) -> Result<u64> {
        let ts = now();
        let result = sqlx::query(
            r#"
            UPDATE sections SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
            WHERE tenant_id = ? AND ingestion_status_id = ? AND status = 'processing'
            "#,
        )
        .bind(message)
        .bind(ts)
        .bind(ts)
        .bind(tenant.as_str())
        .bind(ingestion_status_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset every `failed` section of one document to `pending` and drop
    /// only those sections' chunks. Sibling sections are untouched.
    pub async fn cleanup_failed_sections(
        &self,
        tenant: &TenantId,
        ingestion_status_id: &str,
    ) -> Result<u64> {
        // Ownership check before touching anything.
        self.get_status(tenant, ingestion_status_id).await?;

        let mut tx = self.pool.begin().await?;

        delete_section_chunks(
            &mut tx,
            tenant,
            "SELECT id FROM sections WHERE tenant_id = ?1 AND ingestion_status_id = ?2 AND status = 'failed'",
            ingestion_status_id,
        )
        .await?;

        let reset = sqlx::query(
            r#"
            UPDATE sections SET status = 'pending', chunks_created = 0, entities_extracted = 0,
                episodes_created = 0, error_message = NULL, graph_error = NULL,
                started_at = NULL, completed_at = NULL, updated_at = ?
            WHERE tenant_id = ? AND ingestion_status_id = ? AND status = 'failed'
            "#,
        )
        .bind(now())
        .bind(tenant.as_str())
        .bind(ingestion_status_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reset.rows_affected())
    }

    /// Every failed section, plus sections stuck in `processing` since
    /// before `stale_before`, ordered by category and document.
    pub async fn recovery_report(
        &self,
        tenant: &TenantId,
        stale_before: i64,
    ) -> Result<Vec<FailedSectionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS section_id, s.position, s.kind, s.status, s.error_message,
                   s.preview, s.updated_at, st.id AS status_id, st.path,
                   d.title, d.category
            FROM sections s
            JOIN ingestion_status st ON st.id = s.ingestion_status_id AND st.tenant_id = s.tenant_id
            LEFT JOIN documents d ON d.id = st.document_id AND d.tenant_id = s.tenant_id
            WHERE s.tenant_id = ?
              AND (s.status = 'failed' OR (s.status = 'processing' AND s.updated_at < ?))
            ORDER BY COALESCE(d.category, ''), st.path, s.position
            "#,
        )
        .bind(tenant.as_str())
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let status: String = row.get("status");
                let status: SectionStatus = status.parse()?;
                Ok(FailedSectionSummary {
                    ingestion_status_id: row.get("status_id"),
                    document_path: row.get("path"),
                    document_title: row.get("title"),
                    category: row.get("category"),
                    section_id: row.get("section_id"),
                    position: row.get("position"),
                    kind: kind.parse()?,
                    stale: status == SectionStatus::Processing,
                    status,
                    error_message: row.get("error_message"),
                    preview: row.get("preview"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }
}
