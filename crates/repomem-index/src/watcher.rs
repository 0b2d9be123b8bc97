use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use repomem_llm::LlmProvider;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::indexer::{FileOutcome, RepoIndexer};
use crate::languages::is_indexable;
use crate::source::relative_path;

/// Keeps one repository's index current while its working tree changes.
///
/// Each debounced batch re-indexes the touched files one by one and then
/// refreshes the summaries once.
pub struct IndexWatcher {
    _handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start<P: LlmProvider + 'static>(
        root: &Path,
        repo_id: impl Into<String>,
        indexer: Arc<RepoIndexer<P>>,
        debounce: Duration,
    ) -> Result<Self> {
        let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<String>>(16);
        let watch_root = root.to_path_buf();

        let mut debouncer = new_debouncer(
            debounce,
            move |events: std::result::Result<Vec<DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };
                let batch = batch_paths(&watch_root, events);
                if !batch.is_empty() {
                    let _ = batch_tx.blocking_send(batch);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;

        let repo_id = repo_id.into();
        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            while let Some(batch) = batch_rx.recv().await {
                apply_batch(&indexer, &repo_id, &batch).await;
            }
        });

        Ok(Self { _handle: handle })
    }
}

async fn apply_batch<P: LlmProvider + 'static>(
    indexer: &RepoIndexer<P>,
    repo_id: &str,
    batch: &[String],
) {
    let source = Arc::clone(indexer.source());
    let repo = repo_id.to_string();
    let listed: HashSet<String> =
        match tokio::task::spawn_blocking(move || source.list_files(&repo)).await {
            Ok(Ok(files)) => files.into_iter().collect(),
            Ok(Err(e)) => {
                tracing::warn!(repo = %repo_id, "cannot list files: {e}");
                return;
            }
            Err(e) => {
                tracing::warn!(repo = %repo_id, "listing task failed: {e}");
                return;
            }
        };

    let mut changed = false;
    for path in batch {
        let outcome = if listed.contains(path) {
            indexer.reindex_file(repo_id, path).await
        } else {
            match indexer.store().index_state(repo_id, path).await {
                Ok(Some(_)) => indexer.remove_file(repo_id, path).await,
                Ok(None) => {
                    tracing::trace!(repo = %repo_id, file = %path, "not part of the index");
                    continue;
                }
                Err(e) => Err(e.into()),
            }
        };
        match outcome {
            Ok(FileOutcome::Unchanged) => {}
            Ok(outcome) => {
                tracing::debug!(repo = %repo_id, file = %path, ?outcome, "reindexed");
                changed = true;
            }
            Err(e) => tracing::warn!(repo = %repo_id, file = %path, "reindex failed: {e}"),
        }
    }
    if !changed {
        return;
    }

    let source = Arc::clone(indexer.source());
    let repo = repo_id.to_string();
    let commit = match tokio::task::spawn_blocking(move || source.head_commit(&repo)).await {
        Ok(Ok(commit)) => commit,
        Ok(Err(e)) => {
            tracing::warn!(repo = %repo_id, "cannot read head commit: {e}");
            return;
        }
        Err(e) => {
            tracing::warn!(repo = %repo_id, "head commit task failed: {e}");
            return;
        }
    };
    if let Err(e) = indexer.refresh_summaries(repo_id, &commit).await {
        tracing::warn!(repo = %repo_id, "summary refresh failed: {e}");
    }
}

/// Relative, deduplicated, sorted paths of indexable files in a batch.
///
/// Ignore rules are applied later against the source's own listing.
fn batch_paths(root: &Path, events: Vec<DebouncedEvent>) -> Vec<String> {
    let paths: BTreeSet<String> = events
        .into_iter()
        .filter(|e| e.kind == DebouncedEventKind::Any && is_indexable(&e.path))
        .filter(|e| !in_git_dir(root, &e.path))
        .filter_map(|e| relative_path(root, &e.path))
        .collect();
    paths.into_iter().collect()
}

fn in_git_dir(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .is_some_and(|first| first.as_os_str() == ".git")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use repomem_llm::mock::MockProvider;
    use repomem_store::{ChunkStore, InMemoryChunkStore};

    use super::*;
    use crate::indexer::PipelineConfig;
    use crate::source::FsSource;

    fn indexer(root: &Path) -> Arc<RepoIndexer<MockProvider>> {
        Arc::new(RepoIndexer::new(
            Arc::new(InMemoryChunkStore::new()) as Arc<dyn ChunkStore>,
            Arc::new(FsSource::single("r", root)),
            Arc::new(MockProvider::default()),
            PipelineConfig::default(),
        ))
    }

    fn event(path: PathBuf, kind: DebouncedEventKind) -> DebouncedEvent {
        DebouncedEvent { path, kind }
    }

    #[tokio::test]
    async fn start_with_valid_directory() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = IndexWatcher::start(
            dir.path(),
            "r",
            indexer(dir.path()),
            Duration::from_millis(200),
        );
        assert!(watcher.is_ok());
    }

    #[tokio::test]
    async fn start_with_nonexistent_directory_fails() {
        let missing = Path::new("/nonexistent/path/xyz");
        let result =
            IndexWatcher::start(missing, "r", indexer(missing), Duration::from_millis(200));
        assert!(result.is_err());
    }

    #[test]
    fn batch_is_relative_deduplicated_and_filtered() {
        let root = Path::new("/repo");
        let events = vec![
            event(root.join("src/b.py"), DebouncedEventKind::Any),
            event(root.join("a.rs"), DebouncedEventKind::Any),
            event(root.join("src/b.py"), DebouncedEventKind::Any),
            event(root.join("image.png"), DebouncedEventKind::Any),
            event(root.join("c.rs"), DebouncedEventKind::AnyContinuous),
            event(root.join(".git/config.toml"), DebouncedEventKind::Any),
            event(PathBuf::from("/elsewhere/d.rs"), DebouncedEventKind::Any),
        ];
        assert_eq!(batch_paths(root, events), vec!["a.rs", "src/b.py"]);
    }

    #[tokio::test]
    async fn batch_indexes_changes_and_refreshes_summaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    return 1\n").unwrap();
        let indexer = indexer(dir.path());

        apply_batch(&indexer, "r", &["a.py".to_string()]).await;
        let store = indexer.store();
        assert!(!store.file_chunks("r", "a.py").await.unwrap().is_empty());
        let summary = store.file_chunks("r", crate::summary::REPO_KEY).await.unwrap();
        assert_eq!(summary.len(), 1);

        std::fs::remove_file(dir.path().join("a.py")).unwrap();
        apply_batch(&indexer, "r", &["a.py".to_string()]).await;
        assert!(store.file_chunks("r", "a.py").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignored_files_stay_out_of_the_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        std::fs::write(dir.path().join("target/gen.rs"), "pub fn gen() {}\n").unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    return 1\n").unwrap();
        let indexer = indexer(dir.path());

        let events = vec![
            event(dir.path().join("target/gen.rs"), DebouncedEventKind::Any),
            event(dir.path().join("a.py"), DebouncedEventKind::Any),
        ];
        let batch = batch_paths(dir.path(), events);
        apply_batch(&indexer, "r", &batch).await;

        let store = indexer.store();
        assert!(!store.file_chunks("r", "a.py").await.unwrap().is_empty());
        assert!(store.file_chunks("r", "target/gen.rs").await.unwrap().is_empty());
        assert!(store.index_state("r", "target/gen.rs").await.unwrap().is_none());

        std::fs::write(dir.path().join(".gitignore"), "target/\na.py\n").unwrap();
        apply_batch(&indexer, "r", &["a.py".to_string()]).await;
        assert!(store.file_chunks("r", "a.py").await.unwrap().is_empty());
        assert!(store.index_state("r", "a.py").await.unwrap().is_none());
    }
}
