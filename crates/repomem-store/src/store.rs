use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

use crate::error::StoreError;
use crate::types::{Chunk, ChunkKind, IndexState};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Structured and lexical restrictions applied before ranking.
///
/// Every present field must match. `text` is a case-insensitive substring
/// match against `summary_text` and never against source code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkFilter {
    pub repo_id: Option<String>,
    pub kind: Option<ChunkKind>,
    pub file_path: Option<String>,
    pub text: Option<String>,
}

impl ChunkFilter {
    #[must_use]
    pub fn repo(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: Some(repo_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ChunkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_file(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Lowercased lexical needle, `None` when absent or blank.
    #[must_use]
    pub fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_ascii_lowercase)
    }

    #[must_use]
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(repo) = &self.repo_id
            && chunk.repo_id != *repo
        {
            return false;
        }
        if let Some(kind) = self.kind
            && chunk.kind != kind
        {
            return false;
        }
        if let Some(path) = &self.file_path
            && chunk.file_path != *path
        {
            return false;
        }
        if let Some(needle) = self.needle() {
            return chunk.summary_text.to_ascii_lowercase().contains(&needle);
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Persistence for chunks and per-file index state.
///
/// Chunks are grouped under a `(repo_id, file_path)` key. Source files use
/// their relative path; summaries use reserved keys that never collide with
/// a file (`""` for the repository, `"dir/"` for a module). `replace_file`
/// swaps a whole key: readers observe either the full old set or the full
/// new set.
pub trait ChunkStore: Send + Sync {
    /// Atomically replace every chunk stored under `(repo_id, file_path)`.
    fn replace_file(
        &self,
        repo_id: &str,
        file_path: &str,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Remove all chunks under a key and its index state. Returns removed chunk count.
    fn delete_file(&self, repo_id: &str, file_path: &str)
    -> BoxFuture<'_, Result<usize, StoreError>>;

    /// Insert or overwrite chunks by id.
    fn upsert(&self, chunks: Vec<Chunk>) -> BoxFuture<'_, Result<(), StoreError>>;

    fn file_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Vec<Chunk>, StoreError>>;

    /// All chunks matching `filter`, in deterministic `(repo, path, id)` order.
    fn query(&self, filter: ChunkFilter) -> BoxFuture<'_, Result<Vec<Chunk>, StoreError>>;

    /// Top `k` chunks by cosine similarity among those matching `filter`.
    fn nearest(
        &self,
        vector: Vec<f32>,
        filter: ChunkFilter,
        k: usize,
    ) -> BoxFuture<'_, Result<Vec<ScoredChunk>, StoreError>>;

    fn index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Option<IndexState>, StoreError>>;

    fn index_states(&self, repo_id: &str) -> BoxFuture<'_, Result<Vec<IndexState>, StoreError>>;

    fn put_index_state(&self, state: IndexState) -> BoxFuture<'_, Result<(), StoreError>>;

    fn remove_index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}

#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Total order used whenever scores tie: `(repo_id, file_path)` then `chunk_id`.
#[must_use]
pub fn tie_break(a: &Chunk, b: &Chunk) -> Ordering {
    a.repo_id
        .cmp(&b.repo_id)
        .then_with(|| a.file_path.cmp(&b.file_path))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Descending by score, then [`tie_break`].
pub fn sort_scored(results: &mut [ScoredChunk]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| tie_break(&a.chunk, &b.chunk))
    });
}

/// Score `candidates` against `vector` and keep the best `k`.
pub(crate) fn rank_nearest(
    candidates: impl IntoIterator<Item = Chunk>,
    vector: &[f32],
    k: usize,
) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .map(|chunk| {
            let score = cosine_similarity(vector, &chunk.embedding);
            ScoredChunk { chunk, score }
        })
        .collect();
    sort_scored(&mut scored);
    scored.truncate(k);
    scored
}
