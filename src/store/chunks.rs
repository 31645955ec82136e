use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{fts_table, now, KnowledgeStore};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::{Chunk, Citation, TenantId};

/// A chunk with the score one retrieval channel assigned to it.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

const CITATION_ORDER: &str = "document_ordinal, section_position, chunk_index";

fn chunk_from_row(tenant: &TenantId, row: &SqliteRow) -> Chunk {
    let blob: Option<Vec<u8>> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        tenant_id: tenant.clone(),
        document_id: row.get("document_id"),
        section_id: row.get("section_id"),
        section_position: row.get("section_position"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        page_estimate: row.get("page_estimate"),
        hash: row.get("hash"),
        citation: Citation {
            document_title: row.get("document_title"),
            document_source: row.get("document_source"),
            category: row.get("category"),
            document_ordinal: row.get("document_ordinal"),
        },
        embedding: blob.map(|b| blob_to_vec(&b)),
    }
}

pub(super) async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (id, tenant_id, document_id, section_id, section_position, chunk_index,
                            text, token_count, start_offset, end_offset, page_estimate, hash,
                            document_title, document_source, category, document_ordinal,
                            embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(chunk.tenant_id.as_str())
    .bind(&chunk.document_id)
    .bind(&chunk.section_id)
    .bind(chunk.section_position)
    .bind(chunk.chunk_index)
    .bind(&chunk.text)
    .bind(chunk.token_count)
    .bind(chunk.start_offset)
    .bind(chunk.end_offset)
    .bind(chunk.page_estimate)
    .bind(&chunk.hash)
    .bind(&chunk.citation.document_title)
    .bind(&chunk.citation.document_source)
    .bind(&chunk.citation.category)
    .bind(chunk.citation.document_ordinal)
    .bind(chunk.embedding.as_deref().map(vec_to_blob))
    .bind(now())
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {} (chunk_id, document_id, text) VALUES (?, ?, ?)",
        fts_table(&chunk.tenant_id)
    ))
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(&chunk.text)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Turn free text into an FTS5 expression: every term becomes a quoted
/// phrase so operators and punctuation in user input are matched literally.
pub(crate) fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|t| t.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Map an FTS5 bm25 rank (lower is better, usually negative) into `[0, 1)`.
pub(crate) fn lexical_score(rank: f64) -> f64 {
    let s = (-rank).max(0.0);
    s / (1.0 + s)
}

impl KnowledgeStore {
    /// A document's chunks in citation order.
    pub async fn get_chunks(&self, tenant: &TenantId, document_id: &str) -> Result<Vec<Chunk>> {
        // Ownership check: fails closed for another tenant's document.
        self.get_document(tenant, document_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM chunks WHERE tenant_id = ? AND document_id = ? ORDER BY {}",
            CITATION_ORDER
        ))
        .bind(tenant.as_str())
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| chunk_from_row(tenant, r)).collect())
    }

    pub async fn count_chunks(&self, tenant: &TenantId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn lexical_search(
        &self,
        tenant: &TenantId,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(expr) = fts_query(query_text) else {
            return Ok(Vec::new());
        };
        if !self.has_fts_table(tenant).await? {
            return Ok(Vec::new());
        }

        let fts = fts_table(tenant);
        let rows = sqlx::query(&format!(
            r#"
            SELECT c.*, bm25({fts}) AS lex_rank
            FROM {fts}
            JOIN chunks c ON c.id = {fts}.chunk_id
            WHERE {fts} MATCH ?1
              AND c.tenant_id = ?2
            ORDER BY lex_rank, {order}
            LIMIT ?3
            "#,
            fts = fts,
            order = CITATION_ORDER
        ))
        .bind(&expr)
        .bind(tenant.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("lex_rank");
                ScoredChunk {
                    chunk: chunk_from_row(tenant, row),
                    score: lexical_score(rank),
                }
            })
            .collect())
    }

    /// Brute-force cosine ranking over the tenant's embedded chunks.
    pub async fn similarity_search(
        &self,
        tenant: &TenantId,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM chunks WHERE tenant_id = ? AND embedding IS NOT NULL ORDER BY {}",
            CITATION_ORDER
        ))
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let chunk = chunk_from_row(tenant, row);
                let score = chunk
                    .embedding
                    .as_deref()
                    .map(|v| cosine_similarity(embedding, v) as f64)
                    .unwrap_or(0.0);
                ScoredChunk { chunk, score }
            })
            .collect();

        // Stable: equal scores keep citation order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }
}
