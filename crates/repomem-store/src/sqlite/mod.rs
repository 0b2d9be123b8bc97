mod chunks;
mod state;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::StoreError;
use crate::store::{BoxFuture, ChunkFilter, ChunkStore, ScoredChunk};
use crate::types::{Chunk, IndexState};

/// `SQLite`-backed chunk store. Vector search is a brute-force cosine scan
/// over the rows that pass the structured and lexical filter.
#[derive(Debug, Clone)]
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    /// Open (or create) the database and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // Each in-memory connection is its own database.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!().run(&pool).await?;
        tracing::debug!(path, "chunk store opened");

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl ChunkStore for SqliteChunkStore {
    fn replace_file(
        &self,
        repo_id: &str,
        file_path: &str,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move { self.replace_file_chunks(&repo_id, &file_path, &chunks).await })
    }

    fn delete_file(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<usize, StoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move { self.delete_file_chunks(&repo_id, &file_path).await })
    }

    fn upsert(&self, chunks: Vec<Chunk>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.upsert_chunks(&chunks).await })
    }

    fn file_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Vec<Chunk>, StoreError>> {
        let filter = ChunkFilter::repo(repo_id).with_file(file_path);
        Box::pin(async move { self.select_chunks(&filter).await })
    }

    fn query(&self, filter: ChunkFilter) -> BoxFuture<'_, Result<Vec<Chunk>, StoreError>> {
        Box::pin(async move { self.select_chunks(&filter).await })
    }

    fn nearest(
        &self,
        vector: Vec<f32>,
        filter: ChunkFilter,
        k: usize,
    ) -> BoxFuture<'_, Result<Vec<ScoredChunk>, StoreError>> {
        Box::pin(async move {
            let candidates = self.select_chunks(&filter).await?;
            Ok(crate::store::rank_nearest(candidates, &vector, k))
        })
    }

    fn index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Option<IndexState>, StoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move { self.load_index_state(&repo_id, &file_path).await })
    }

    fn index_states(&self, repo_id: &str) -> BoxFuture<'_, Result<Vec<IndexState>, StoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move { self.load_index_states(&repo_id).await })
    }

    fn put_index_state(&self, state: IndexState) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.save_index_state(&state).await })
    }

    fn remove_index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move { self.delete_index_state(&repo_id, &file_path).await })
    }
}
