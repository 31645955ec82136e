use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use super::sections::delete_document_content;
use super::{check_owner, now, KnowledgeStore};
use crate::error::{PipelineError, Result};
use crate::models::{Document, IngestionStatus, TenantId};

/// Document attributes known after extraction.
#[derive(Debug, Clone)]
pub struct DocumentDraft {
    pub source_path: String,
    pub title: String,
    pub category: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub word_count: i64,
    pub page_count: i64,
}

/// Stable across re-ingestion: the same tenant and path always map to the
/// same document id.
pub fn document_id(tenant: &TenantId, source_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(source_path.as_bytes());
    hex::encode(hasher.finalize())
}

fn document_from_row(tenant: &TenantId, row: &SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        tenant_id: tenant.clone(),
        title: row.get("title"),
        source_path: row.get("source_path"),
        category: row.get("category"),
        ordinal: row.get("ordinal"),
        content_hash: row.get("content_hash"),
        size_bytes: row.get("size_bytes"),
        word_count: row.get("word_count"),
        page_count: row.get("page_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl KnowledgeStore {
    /// Commit a freshly extracted version of a file in one transaction.
    ///
    /// With `supersede` set, the previous version's sections and chunks are
    /// dropped first. The document row is inserted or refreshed (its
    /// ordinal is assigned once, as the next free value for the tenant, and
    /// kept afterwards), linked to the status row, and the status row takes
    /// the new fingerprint. Until this commits the status row keeps the
    /// previous fingerprint, so an interrupted or failed re-ingestion is
    /// classified `REINGEST` again and the previous chunks stay searchable.
    pub async fn stage_document(
        &self,
        tenant: &TenantId,
        status: &IngestionStatus,
        draft: &DocumentDraft,
        modified_at: i64,
        supersede: bool,
    ) -> Result<Document> {
        check_owner(tenant, status.tenant_id.as_str(), "ingestion status", &status.id)?;
        let id = document_id(tenant, &draft.source_path);
        let ts = now();

        let mut tx = self.pool.begin().await?;

        if supersede {
            let removed = delete_document_content(
                &mut tx,
                tenant,
                &status.id,
                status.document_id.as_deref(),
            )
            .await?;
            debug!(tenant = %tenant, document = %id, removed, "superseded previous chunks");
        }

        sqlx::query(
            r#"
            INSERT INTO documents (id, tenant_id, title, source_path, category, ordinal,
                                   content_hash, size_bytes, word_count, page_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5,
                    (SELECT COALESCE(MAX(ordinal), 0) + 1 FROM documents WHERE tenant_id = ?2),
                    ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                word_count = excluded.word_count,
                page_count = excluded.page_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(tenant.as_str())
        .bind(&draft.title)
        .bind(&draft.source_path)
        .bind(&draft.category)
        .bind(&draft.content_hash)
        .bind(draft.size_bytes)
        .bind(draft.word_count)
        .bind(draft.page_count)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE ingestion_status SET document_id = ?, file_hash = ?, file_size = ?,
                modified_at = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ?
            "#,
        )
        .bind(&id)
        .bind(&draft.content_hash)
        .bind(draft.size_bytes)
        .bind(modified_at)
        .bind(ts)
        .bind(tenant.as_str())
        .bind(&status.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.get_document(tenant, &id).await
    }

    pub async fn get_document(&self, tenant: &TenantId, id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))?;

        let owner: String = row.get("tenant_id");
        check_owner(tenant, &owner, "document", id)?;
        Ok(document_from_row(tenant, &row))
    }
}
