use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StoreError;
use crate::store::{BoxFuture, ChunkFilter, ChunkStore, ScoredChunk, rank_nearest, tie_break};
use crate::types::{Chunk, IndexState};

#[derive(Default)]
struct Inner {
    chunks: HashMap<String, Chunk>,
    states: BTreeMap<(String, String), IndexState>,
}

/// Process-local chunk store. Every mutation runs under a single write lock,
/// so `replace_file` is atomic with respect to concurrent readers.
pub struct InMemoryChunkStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl InMemoryChunkStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a backend outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.chunks.len())
    }

    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".into()))
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for InMemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChunkStore").finish_non_exhaustive()
    }
}

fn under_key(chunk: &Chunk, repo_id: &str, file_path: &str) -> bool {
    chunk.repo_id == repo_id && chunk.file_path == file_path
}

impl ChunkStore for InMemoryChunkStore {
    fn replace_file(
        &self,
        repo_id: &str,
        file_path: &str,
        chunks: Vec<Chunk>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move {
            self.check()?;
            let mut inner = self.write()?;
            inner
                .chunks
                .retain(|_, c| !under_key(c, &repo_id, &file_path));
            for chunk in chunks {
                inner.chunks.insert(chunk.chunk_id.clone(), chunk);
            }
            Ok(())
        })
    }

    fn delete_file(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<usize, StoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move {
            self.check()?;
            let mut inner = self.write()?;
            let before = inner.chunks.len();
            inner
                .chunks
                .retain(|_, c| !under_key(c, &repo_id, &file_path));
            let removed = before - inner.chunks.len();
            inner.states.remove(&(repo_id, file_path));
            Ok(removed)
        })
    }

    fn upsert(&self, chunks: Vec<Chunk>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.check()?;
            let mut inner = self.write()?;
            for chunk in chunks {
                inner.chunks.insert(chunk.chunk_id.clone(), chunk);
            }
            Ok(())
        })
    }

    fn file_chunks(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Vec<Chunk>, StoreError>> {
        let filter = ChunkFilter::repo(repo_id).with_file(file_path);
        Box::pin(async move {
            self.check()?;
            let inner = self.read()?;
            let mut out: Vec<Chunk> = inner
                .chunks
                .values()
                .filter(|c| filter.matches(c))
                .cloned()
                .collect();
            out.sort_by(tie_break);
            Ok(out)
        })
    }

    fn query(&self, filter: ChunkFilter) -> BoxFuture<'_, Result<Vec<Chunk>, StoreError>> {
        Box::pin(async move {
            self.check()?;
            let inner = self.read()?;
            let mut out: Vec<Chunk> = inner
                .chunks
                .values()
                .filter(|c| filter.matches(c))
                .cloned()
                .collect();
            out.sort_by(tie_break);
            Ok(out)
        })
    }

    fn nearest(
        &self,
        vector: Vec<f32>,
        filter: ChunkFilter,
        k: usize,
    ) -> BoxFuture<'_, Result<Vec<ScoredChunk>, StoreError>> {
        Box::pin(async move {
            self.check()?;
            let candidates: Vec<Chunk> = {
                let inner = self.read()?;
                inner
                    .chunks
                    .values()
                    .filter(|c| filter.matches(c))
                    .cloned()
                    .collect()
            };
            Ok(rank_nearest(candidates, &vector, k))
        })
    }

    fn index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Option<IndexState>, StoreError>> {
        let key = (repo_id.to_owned(), file_path.to_owned());
        Box::pin(async move {
            self.check()?;
            Ok(self.read()?.states.get(&key).cloned())
        })
    }

    fn index_states(&self, repo_id: &str) -> BoxFuture<'_, Result<Vec<IndexState>, StoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move {
            self.check()?;
            Ok(self
                .read()?
                .states
                .values()
                .filter(|s| s.repo_id == repo_id)
                .cloned()
                .collect())
        })
    }

    fn put_index_state(&self, state: IndexState) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.check()?;
            let key = (state.repo_id.clone(), state.file_path.clone());
            self.write()?.states.insert(key, state);
            Ok(())
        })
    }

    fn remove_index_state(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = (repo_id.to_owned(), file_path.to_owned());
        Box::pin(async move {
            self.check()?;
            self.write()?.states.remove(&key);
            Ok(())
        })
    }
}
