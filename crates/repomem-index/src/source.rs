//! Repository source boundary: head commit, file listing and file content.
//!
//! Sources are synchronous; the indexer calls them from `spawn_blocking`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{IndexError, Result};
use crate::languages::is_indexable;

/// Commit id reported for a directory that is not a git checkout.
pub const WORKTREE_COMMIT: &str = "worktree";

pub trait RepoSource: Send + Sync {
    /// Current commit of the repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository is unknown or unreadable.
    fn head_commit(&self, repo_id: &str) -> Result<String>;

    /// Relative, `/`-separated paths of every indexable file, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be listed.
    fn list_files(&self, repo_id: &str) -> Result<Vec<String>>;

    /// # Errors
    ///
    /// Returns [`IndexError::FileNotFound`] if the file does not exist and
    /// [`IndexError::OutsideRepo`] if `file_path` leaves the repository.
    fn read_file(&self, repo_id: &str, file_path: &str, commit: &str) -> Result<Vec<u8>>;

    /// Lines `start..=end` (1-based) of a file.
    ///
    /// # Errors
    ///
    /// Same as [`RepoSource::read_file`].
    fn read_lines(
        &self,
        repo_id: &str,
        file_path: &str,
        commit: &str,
        start: usize,
        end: usize,
    ) -> Result<String> {
        let first = start.max(1);
        if end < first {
            return Ok(String::new());
        }
        let bytes = self.read_file(repo_id, file_path, commit)?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text
            .lines()
            .skip(first - 1)
            .take(end - first + 1)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Working-tree source: each repository id maps to a directory on disk.
///
/// Content is always read from the working tree; `commit` arguments are
/// informational.
#[derive(Debug, Default)]
pub struct FsSource {
    roots: HashMap<String, PathBuf>,
}

impl FsSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(repo_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mut source = Self::new();
        source.insert(repo_id, root);
        source
    }

    pub fn insert(&mut self, repo_id: impl Into<String>, root: impl Into<PathBuf>) {
        self.roots.insert(repo_id.into(), root.into());
    }

    /// # Errors
    ///
    /// Returns [`IndexError::UnknownRepo`] if `repo_id` was never registered.
    pub fn root(&self, repo_id: &str) -> Result<&Path> {
        self.roots
            .get(repo_id)
            .map(PathBuf::as_path)
            .ok_or_else(|| IndexError::UnknownRepo(repo_id.to_string()))
    }
}

impl RepoSource for FsSource {
    fn head_commit(&self, repo_id: &str) -> Result<String> {
        let root = self.root(repo_id)?;
        if !root.is_dir() {
            return Err(IndexError::Planning {
                repo_id: repo_id.to_string(),
                message: format!("{} is not a directory", root.display()),
            });
        }
        Ok(resolve_head(root))
    }

    fn list_files(&self, repo_id: &str) -> Result<Vec<String>> {
        let root = self.root(repo_id)?;
        if !root.is_dir() {
            return Err(IndexError::Planning {
                repo_id: repo_id.to_string(),
                message: format!("{} is not a directory", root.display()),
            });
        }

        let mut files: Vec<String> = ignore::WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .build()
            .flatten()
            .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()) && is_indexable(e.path()))
            .filter_map(|e| relative_path(root, e.path()))
            .collect();
        files.sort();
        Ok(files)
    }

    fn read_file(&self, repo_id: &str, file_path: &str, _commit: &str) -> Result<Vec<u8>> {
        let root = self.root(repo_id)?;
        let rel = confined(file_path)?;
        match std::fs::read(root.join(rel)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IndexError::FileNotFound(file_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `root`-relative path with `/` separators.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Reject absolute paths and parent components so reads stay under the root.
fn confined(file_path: &str) -> Result<&Path> {
    let rel = Path::new(file_path);
    let inside = !file_path.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if inside {
        Ok(rel)
    } else {
        Err(IndexError::OutsideRepo(file_path.to_string()))
    }
}

/// Resolve `HEAD` from the `.git` directory without shelling out to git.
fn resolve_head(root: &Path) -> String {
    let mut git_dir = root.join(".git");
    // Worktrees and submodules carry a `.git` file pointing at the real dir.
    if git_dir.is_file()
        && let Ok(pointer) = std::fs::read_to_string(&git_dir)
        && let Some(target) = pointer.trim().strip_prefix("gitdir: ")
    {
        git_dir = root.join(target);
    }

    let Ok(head) = std::fs::read_to_string(git_dir.join("HEAD")) else {
        return WORKTREE_COMMIT.to_string();
    };
    let head = head.trim();
    let Some(reference) = head.strip_prefix("ref: ") else {
        return head.to_string();
    };

    if let Ok(sha) = std::fs::read_to_string(git_dir.join(reference)) {
        return sha.trim().to_string();
    }
    if let Ok(packed) = std::fs::read_to_string(git_dir.join("packed-refs")) {
        for line in packed.lines() {
            if let Some((sha, name)) = line.split_once(' ')
                && name == reference
            {
                return sha.to_string();
            }
        }
    }
    tracing::debug!(reference, "unresolved git ref, using worktree commit");
    WORKTREE_COMMIT.to_string()
}

#[derive(Debug, Default)]
struct MemoryRepo {
    commit: String,
    files: BTreeMap<String, Vec<u8>>,
}

/// In-process source for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySource {
    repos: RwLock<HashMap<String, MemoryRepo>>,
    fail_listing: AtomicBool,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_commit(&self, repo_id: &str, commit: &str) {
        if let Ok(mut repos) = self.repos.write() {
            repos.entry(repo_id.to_string()).or_default().commit = commit.to_string();
        }
    }

    pub fn set_file(&self, repo_id: &str, file_path: &str, content: impl Into<Vec<u8>>) {
        if let Ok(mut repos) = self.repos.write() {
            repos
                .entry(repo_id.to_string())
                .or_default()
                .files
                .insert(file_path.to_string(), content.into());
        }
    }

    pub fn remove_file(&self, repo_id: &str, file_path: &str) {
        if let Ok(mut repos) = self.repos.write()
            && let Some(repo) = repos.get_mut(repo_id)
        {
            repo.files.remove(file_path);
        }
    }

    /// Make `list_files` fail, simulating an unreadable repository.
    pub fn set_listing_fails(&self, fails: bool) {
        self.fail_listing.store(fails, Ordering::SeqCst);
    }

    fn with_repo<T>(&self, repo_id: &str, f: impl FnOnce(&MemoryRepo) -> Result<T>) -> Result<T> {
        let repos = self
            .repos
            .read()
            .map_err(|e| IndexError::Other(e.to_string()))?;
        let repo = repos
            .get(repo_id)
            .ok_or_else(|| IndexError::UnknownRepo(repo_id.to_string()))?;
        f(repo)
    }
}

impl RepoSource for MemorySource {
    fn head_commit(&self, repo_id: &str) -> Result<String> {
        self.with_repo(repo_id, |repo| Ok(repo.commit.clone()))
    }

    fn list_files(&self, repo_id: &str) -> Result<Vec<String>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(IndexError::Planning {
                repo_id: repo_id.to_string(),
                message: "listing failed".into(),
            });
        }
        self.with_repo(repo_id, |repo| {
            Ok(repo
                .files
                .keys()
                .filter(|p| is_indexable(Path::new(p)))
                .cloned()
                .collect())
        })
    }

    fn read_file(&self, repo_id: &str, file_path: &str, _commit: &str) -> Result<Vec<u8>> {
        self.with_repo(repo_id, |repo| {
            repo.files
                .get(file_path)
                .cloned()
                .ok_or_else(|| IndexError::FileNotFound(file_path.to_string()))
        })
    }
}
