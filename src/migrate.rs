use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ordinal is per tenant and never reassigned once given.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            title TEXT NOT NULL,
            source_path TEXT NOT NULL,
            category TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            word_count INTEGER NOT NULL DEFAULT 0,
            page_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(tenant_id, source_path),
            UNIQUE(tenant_id, ordinal),
            FOREIGN KEY (tenant_id) REFERENCES tenants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_status (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            path TEXT NOT NULL,
            document_id TEXT,
            file_hash TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            chunks_created INTEGER NOT NULL DEFAULT 0,
            entities_extracted INTEGER NOT NULL DEFAULT 0,
            episodes_created INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            error_details TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            updated_at INTEGER NOT NULL,
            UNIQUE(tenant_id, path),
            FOREIGN KEY (tenant_id) REFERENCES tenants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sections (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            ingestion_status_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            kind TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            content_length INTEGER NOT NULL,
            preview TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            chunks_created INTEGER NOT NULL DEFAULT 0,
            entities_extracted INTEGER NOT NULL DEFAULT 0,
            episodes_created INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            graph_error TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            updated_at INTEGER NOT NULL,
            UNIQUE(ingestion_status_id, position),
            FOREIGN KEY (ingestion_status_id) REFERENCES ingestion_status(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            section_position INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            page_estimate INTEGER NOT NULL,
            hash TEXT NOT NULL,
            document_title TEXT NOT NULL,
            document_source TEXT NOT NULL,
            category TEXT NOT NULL,
            document_ordinal INTEGER NOT NULL,
            embedding BLOB,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, section_position, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id),
            FOREIGN KEY (section_id) REFERENCES sections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lexical indexes are per tenant and created by `KnowledgeStore::ensure_tenant`.

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id)",
        "CREATE INDEX IF NOT EXISTS idx_status_tenant_status ON ingestion_status(tenant_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_sections_tenant_status ON sections(tenant_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_tenant ON chunks(tenant_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_section ON chunks(section_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
