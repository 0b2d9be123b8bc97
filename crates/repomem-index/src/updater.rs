//! Atomic per-file chunk replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use repomem_store::{Chunk, ChunkStore, IndexState, StoreError};

use crate::error::{IndexError, Result};
use crate::retry::{RetryPolicy, with_retry};

type FileKey = (String, String);

/// Serializes updates per `(repo_id, file_path)` and replays failed swaps
/// from scratch.
pub struct FileUpdater<S: ?Sized> {
    store: Arc<S>,
    locks: Mutex<HashMap<FileKey, Arc<tokio::sync::Mutex<()>>>>,
    policy: RetryPolicy,
}

impl<S: ChunkStore + ?Sized> FileUpdater<S> {
    #[must_use]
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            policy,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Replace the file's chunk set, then record `state`.
    ///
    /// The index state is written only after the swap is confirmed; if the
    /// state write fails the file is re-indexed on the next run.
    ///
    /// # Errors
    ///
    /// Returns the last store error once retries are exhausted. The previous
    /// chunk set is then still in place.
    pub async fn swap(&self, chunks: Vec<Chunk>, state: IndexState) -> Result<()> {
        let repo_id = state.repo_id.clone();
        let file_path = state.file_path.clone();
        let lock = self.lock_for(&repo_id, &file_path)?;
        let result: Result<()> = async {
            let _guard = lock.lock().await;
            self.replace(&repo_id, &file_path, &chunks).await?;
            with_retry("index state write", self.policy, is_retryable, || {
                self.store.put_index_state(state.clone())
            })
            .await?;
            Ok(())
        }
        .await;
        self.release(&repo_id, &file_path, lock);
        result
    }

    /// Replace the chunks under a key that carries no index state.
    ///
    /// # Errors
    ///
    /// Returns the last store error once retries are exhausted.
    pub async fn swap_chunks(&self, repo_id: &str, key: &str, chunks: Vec<Chunk>) -> Result<()> {
        let lock = self.lock_for(repo_id, key)?;
        let result: Result<()> = async {
            let _guard = lock.lock().await;
            self.replace(repo_id, key, &chunks).await
        }
        .await;
        self.release(repo_id, key, lock);
        result
    }

    /// Delete every chunk of the file and its index state.
    ///
    /// # Errors
    ///
    /// Returns the last store error once retries are exhausted.
    pub async fn remove(&self, repo_id: &str, file_path: &str) -> Result<usize> {
        let lock = self.lock_for(repo_id, file_path)?;
        let result: Result<usize> = async {
            let _guard = lock.lock().await;
            let removed = with_retry("chunk delete", self.policy, is_retryable, || {
                self.store.delete_file(repo_id, file_path)
            })
            .await?;
            with_retry("index state delete", self.policy, is_retryable, || {
                self.store.remove_index_state(repo_id, file_path)
            })
            .await?;
            tracing::debug!(repo = %repo_id, file = %file_path, removed, "file removed from index");
            Ok(removed)
        }
        .await;
        self.release(repo_id, file_path, lock);
        result
    }

    async fn replace(&self, repo_id: &str, key: &str, chunks: &[Chunk]) -> Result<()> {
        with_retry("chunk swap", self.policy, is_retryable, || {
            self.store.replace_file(repo_id, key, chunks.to_vec())
        })
        .await
        .map_err(IndexError::from)
    }

    fn lock_for(&self, repo_id: &str, file_path: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| IndexError::Other(format!("updater lock map poisoned: {e}")))?;
        Ok(Arc::clone(
            locks
                .entry((repo_id.to_string(), file_path.to_string()))
                .or_default(),
        ))
    }

    /// Drop the map entry once no other updater holds the key.
    fn release(&self, repo_id: &str, file_path: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        drop(lock);
        let key = (repo_id.to_string(), file_path.to_string());
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

fn is_retryable(e: &StoreError) -> bool {
    !matches!(e, StoreError::InvalidValue(_))
}
