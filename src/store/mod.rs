//! Tenant-scoped persisted store.
//!
//! [`KnowledgeStore`] wraps the SQLite pool and is the only place SQL is
//! written. Every method takes a [`TenantId`] as its first argument and every
//! statement filters on `tenant_id`, so an unscoped query cannot be
//! expressed through this API.
//!
//! Transaction boundaries are scoped to one document's rows (or one
//! section's rows), never tenant-wide, so readers of the same tenant are
//! never blocked by a long ingestion.

mod chunks;
mod documents;
mod sections;
mod status;

use sqlx::SqlitePool;

use crate::error::{PipelineError, Result};
use crate::models::TenantId;

pub use chunks::ScoredChunk;
pub use documents::{document_id, DocumentDraft};
pub use sections::NewSection;

#[derive(Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
}

impl KnowledgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register the tenant on first use and create its lexical index.
    pub async fn ensure_tenant(&self, tenant: &TenantId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO tenants (id, created_at) VALUES (?, ?)")
            .bind(tenant.as_str())
            .bind(now())
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5(chunk_id UNINDEXED, document_id UNINDEXED, text)",
            fts_table(tenant)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn has_fts_table(&self, tenant: &TenantId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(fts_table(tenant))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

/// Name of the tenant's FTS5 table.
///
/// Each tenant gets its own table so bm25 term statistics are computed
/// over that tenant's chunks only. The id is hex-encoded because SQLite
/// identifiers are case-insensitive while tenant ids are not.
pub(crate) fn fts_table(tenant: &TenantId) -> String {
    format!("chunks_fts_{}", hex::encode(tenant.as_str()))
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Reject a row that was fetched by id but belongs to another tenant.
pub(crate) fn check_owner(tenant: &TenantId, owner: &str, what: &str, id: &str) -> Result<()> {
    if owner != tenant.as_str() {
        return Err(PipelineError::TenantIsolation(format!(
            "{} {} is not owned by tenant {}",
            what, id, tenant
        )));
    }
    Ok(())
}
