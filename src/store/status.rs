use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{check_owner, now, KnowledgeStore};
use crate::error::{PipelineError, Result};
use crate::models::{DocumentStatus, IngestionStatus, TenantId};

const STATUS_COLUMNS: &str = "id, tenant_id, path, document_id, file_hash, file_size, modified_at, \
     status, chunks_created, entities_extracted, episodes_created, error_message, error_details, \
     started_at, completed_at, updated_at";

fn status_from_row(tenant: &TenantId, row: &SqliteRow) -> Result<IngestionStatus> {
    let status: String = row.get("status");
    Ok(IngestionStatus {
        id: row.get("id"),
        tenant_id: tenant.clone(),
        path: row.get("path"),
        document_id: row.get("document_id"),
        file_hash: row.get("file_hash"),
        file_size: row.get("file_size"),
        modified_at: row.get("modified_at"),
        status: status.parse()?,
        chunks_created: row.get("chunks_created"),
        entities_extracted: row.get("entities_extracted"),
        episodes_created: row.get("episodes_created"),
        error_message: row.get("error_message"),
        error_details: row.get("error_details"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        updated_at: row.get("updated_at"),
    })
}

impl KnowledgeStore {
    pub async fn get_status_by_path(
        &self,
        tenant: &TenantId,
        path: &str,
    ) -> Result<Option<IngestionStatus>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_status WHERE tenant_id = ? AND path = ?",
            STATUS_COLUMNS
        ))
        .bind(tenant.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| status_from_row(tenant, &r)).transpose()
    }

    /// Fetch a status row by id. A row owned by another tenant is an
    /// isolation violation, not a miss.
    pub async fn get_status(&self, tenant: &TenantId, id: &str) -> Result<IngestionStatus> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_status WHERE id = ?",
            STATUS_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("ingestion status {}", id)))?;

        let owner: String = row.get("tenant_id");
        check_owner(tenant, &owner, "ingestion status", id)?;
        status_from_row(tenant, &row)
    }

    /// Fetch the status row for a path, creating it on first sight. An
    /// existing row keeps its recorded fingerprint; the new one is written
    /// by [`KnowledgeStore::stage_document`] together with the content it
    /// describes.
    pub async fn open_status(
        &self,
        tenant: &TenantId,
        path: &str,
        file_hash: &str,
        file_size: i64,
        modified_at: i64,
    ) -> Result<IngestionStatus> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_status (id, tenant_id, path, file_hash, file_size, modified_at, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(tenant_id, path) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(tenant.as_str())
        .bind(path)
        .bind(file_hash)
        .bind(file_size)
        .bind(modified_at)
        .bind(now())
        .execute(&self.pool)
        .await?;

        self.get_status_by_path(tenant, path)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("ingestion status for {}", path)))
    }

    pub async fn set_document_status(
        &self,
        tenant: &TenantId,
        id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
        error_details: Option<&str>,
    ) -> Result<()> {
        let ts = now();
        let (started_at, completed_at) = match status {
            DocumentStatus::Processing => (Some(ts), None),
            DocumentStatus::Pending => (None, None),
            _ => (None, Some(ts)),
        };

        sqlx::query(
            r#"
            UPDATE ingestion_status SET
                status = ?,
                error_message = ?,
                error_details = ?,
                started_at = COALESCE(?, started_at),
                completed_at = ?,
                updated_at = ?
            WHERE tenant_id = ? AND id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(error_details)
        .bind(started_at)
        .bind(completed_at)
        .bind(ts)
        .bind(tenant.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Roll section counters up onto the document row.
    pub async fn refresh_status_counts(&self, tenant: &TenantId, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingestion_status SET
                chunks_created = (SELECT COALESCE(SUM(chunks_created), 0) FROM sections
                                  WHERE tenant_id = ?1 AND ingestion_status_id = ?2),
                entities_extracted = (SELECT COALESCE(SUM(entities_extracted), 0) FROM sections
                                      WHERE tenant_id = ?1 AND ingestion_status_id = ?2),
                episodes_created = (SELECT COALESCE(SUM(episodes_created), 0) FROM sections
                                    WHERE tenant_id = ?1 AND ingestion_status_id = ?2)
            WHERE tenant_id = ?1 AND id = ?2
            "#,
        )
        .bind(tenant.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_statuses(&self, tenant: &TenantId) -> Result<Vec<IngestionStatus>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_status WHERE tenant_id = ? ORDER BY path",
            STATUS_COLUMNS
        ))
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| status_from_row(tenant, r)).collect()
    }
}
