use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::SqliteChunkStore;
use crate::error::StoreError;
use crate::store::ChunkFilter;
use crate::types::{Chunk, EnrichmentRecord};

const COLUMNS: &str = "chunk_id, repo_id, file_path, symbol_path, kind, commit_sha, line_start, \
     line_end, content_hash, summary_text, preview, embedding, schema_version, enrichment_level, \
     cost_estimate, underchunked";

#[derive(sqlx::FromRow)]
struct ChunkRow {
    chunk_id: String,
    repo_id: String,
    file_path: String,
    symbol_path: Option<String>,
    kind: String,
    commit_sha: String,
    line_start: Option<i64>,
    line_end: Option<i64>,
    content_hash: String,
    summary_text: String,
    preview: String,
    embedding: Vec<u8>,
    schema_version: String,
    enrichment_level: String,
    cost_estimate: i64,
    underchunked: bool,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = StoreError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        let line_range = match (row.line_start, row.line_end) {
            (Some(start), Some(end)) => Some((usize::try_from(start)?, usize::try_from(end)?)),
            _ => None,
        };
        Ok(Self {
            kind: row.kind.parse()?,
            line_range,
            embedding: decode_embedding(&row.embedding)?,
            enrichment: EnrichmentRecord {
                schema_version: row.schema_version.parse()?,
                enrichment_level: row.enrichment_level.parse()?,
                cost_estimate: u32::try_from(row.cost_estimate)?,
                underchunked: row.underchunked,
            },
            chunk_id: row.chunk_id,
            repo_id: row.repo_id,
            file_path: row.file_path,
            symbol_path: row.symbol_path,
            commit_sha: row.commit_sha,
            content_hash: row.content_hash,
            summary_text: row.summary_text,
            preview: row.preview,
        })
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidValue(format!(
            "embedding blob of {} bytes is not a whole number of f32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

async fn insert_chunk(conn: &mut SqliteConnection, chunk: &Chunk) -> Result<(), StoreError> {
    let (line_start, line_end) = match chunk.line_range {
        Some((start, end)) => (Some(i64::try_from(start)?), Some(i64::try_from(end)?)),
        None => (None, None),
    };
    sqlx::query(
        "INSERT OR REPLACE INTO chunks (chunk_id, repo_id, file_path, symbol_path, kind, \
         commit_sha, line_start, line_end, content_hash, summary_text, preview, embedding, \
         schema_version, enrichment_level, cost_estimate, underchunked) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.chunk_id)
    .bind(&chunk.repo_id)
    .bind(&chunk.file_path)
    .bind(chunk.symbol_path.as_deref())
    .bind(chunk.kind.as_str())
    .bind(&chunk.commit_sha)
    .bind(line_start)
    .bind(line_end)
    .bind(&chunk.content_hash)
    .bind(&chunk.summary_text)
    .bind(&chunk.preview)
    .bind(encode_embedding(&chunk.embedding))
    .bind(chunk.enrichment.schema_version.as_str())
    .bind(chunk.enrichment.enrichment_level.as_str())
    .bind(i64::from(chunk.enrichment.cost_estimate))
    .bind(chunk.enrichment.underchunked)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl SqliteChunkStore {
    /// Delete and re-insert every chunk under a key inside one transaction.
    pub(super) async fn replace_file_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
        chunks: &[Chunk],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE repo_id = ? AND file_path = ?")
            .bind(repo_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            insert_chunk(&mut *tx, chunk).await?;
        }

        tx.commit().await?;
        tracing::debug!(repo_id, file_path, chunks = chunks.len(), "file chunks replaced");
        Ok(())
    }

    pub(super) async fn delete_file_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM chunks WHERE repo_id = ? AND file_path = ?")
            .bind(repo_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM index_state WHERE repo_id = ? AND file_path = ?")
            .bind(repo_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(usize::try_from(removed)?)
    }

    pub(super) async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_chunk(&mut *tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn select_chunks(
        &self,
        filter: &ChunkFilter,
    ) -> Result<Vec<Chunk>, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM chunks WHERE 1 = 1"));
        if let Some(repo_id) = &filter.repo_id {
            qb.push(" AND repo_id = ").push_bind(repo_id.clone());
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(file_path) = &filter.file_path {
            qb.push(" AND file_path = ").push_bind(file_path.clone());
        }
        if let Some(needle) = filter.needle() {
            qb.push(" AND instr(lower(summary_text), ")
                .push_bind(needle)
                .push(") > 0");
        }
        qb.push(" ORDER BY repo_id, file_path, chunk_id");

        let rows: Vec<ChunkRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Chunk::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChunkStore;
    use crate::store::test_support::chunk;
    use crate::types::{ChunkKind, EnrichmentLevel};

    async fn test_store() -> SqliteChunkStore {
        SqliteChunkStore::new(":memory:").await.unwrap()
    }

    #[test]
    fn embedding_blob_rejects_ragged_length() {
        assert!(decode_embedding(&[0, 0, 0]).is_err());
        assert_eq!(decode_embedding(&encode_embedding(&[0.25, -1.0])).unwrap(), vec![0.25, -1.0]);
    }

    #[tokio::test]
    async fn stored_chunk_preserves_every_field() {
        let store = test_store().await;
        let mut c = chunk("r", "src/a.py", Some("Counter.bump"), "Method bump", vec![0.5, 0.25]);
        c.enrichment.enrichment_level = EnrichmentLevel::LlmSummarized;
        c.enrichment.cost_estimate = 42;
        c.enrichment.underchunked = true;
        c.line_range = Some((10, 20));
        store.upsert(vec![c.clone()]).await.unwrap();

        let loaded = store.file_chunks("r", "src/a.py").await.unwrap();
        assert_eq!(loaded, vec![c]);
    }

    #[tokio::test]
    async fn file_index_without_range_roundtrips() {
        let store = test_store().await;
        let c = chunk("r", "a.py", None, "File a.py", vec![1.0]);
        store.upsert(vec![c]).await.unwrap();
        let loaded = store.file_chunks("r", "a.py").await.unwrap();
        assert_eq!(loaded[0].line_range, None);
        assert_eq!(loaded[0].kind, ChunkKind::FileIndex);
    }

    #[tokio::test]
    async fn replace_file_is_full_swap() {
        let store = test_store().await;
        store
            .replace_file(
                "r",
                "a.py",
                vec![
                    chunk("r", "a.py", None, "file", vec![1.0]),
                    chunk("r", "a.py", Some("old"), "old", vec![1.0]),
                ],
            )
            .await
            .unwrap();
        store
            .replace_file("r", "a.py", vec![chunk("r", "a.py", Some("new"), "new", vec![1.0])])
            .await
            .unwrap();

        let loaded = store.file_chunks("r", "a.py").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].symbol_path.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn replace_file_keeps_other_keys() {
        let store = test_store().await;
        let mut summary = chunk("r", "./", None, "module", vec![1.0]);
        summary.kind = ChunkKind::ModuleSummary;
        store.upsert(vec![summary]).await.unwrap();
        store.replace_file("r", "a.py", vec![]).await.unwrap();
        let all = store.query(ChunkFilter::repo("r")).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, ChunkKind::ModuleSummary);
    }

    #[tokio::test]
    async fn select_applies_text_filter_case_insensitively() {
        let store = test_store().await;
        store
            .upsert(vec![
                chunk("r", "a.py", Some("f"), "Bumps the COUNTER", vec![1.0]),
                chunk("r", "b.py", Some("g"), "Parses tokens", vec![1.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .query(ChunkFilter::repo("r").with_text("counter"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "a.py");

        let none = store
            .query(ChunkFilter::repo("r").with_text("def f"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn select_orders_by_repo_path_id() {
        let store = test_store().await;
        store
            .upsert(vec![
                chunk("r", "b.py", Some("g"), "s", vec![1.0]),
                chunk("r", "a.py", Some("f"), "s", vec![1.0]),
            ])
            .await
            .unwrap();
        let all = store.query(ChunkFilter::default()).await.unwrap();
        assert_eq!(all[0].file_path, "a.py");
        assert_eq!(all[1].file_path, "b.py");
    }

    #[tokio::test]
    async fn nearest_ranks_by_cosine() {
        let store = test_store().await;
        store
            .upsert(vec![
                chunk("r", "a.py", Some("f"), "s", vec![1.0, 0.0]),
                chunk("r", "b.py", Some("g"), "s", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let hits = store
            .nearest(vec![0.1, 0.9], ChunkFilter::repo("r"), 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.file_path, "b.py");
    }

    #[tokio::test]
    async fn delete_file_counts_rows() {
        let store = test_store().await;
        store
            .replace_file(
                "r",
                "a.py",
                vec![
                    chunk("r", "a.py", None, "file", vec![1.0]),
                    chunk("r", "a.py", Some("f"), "f", vec![1.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.delete_file("r", "a.py").await.unwrap(), 2);
        assert!(store.query(ChunkFilter::default()).await.unwrap().is_empty());
    }
}
