//! Error types for repomem-index.

use std::num::TryFromIntError;

/// Errors that can occur while indexing or querying a repository.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk store error.
    #[error("store error: {0}")]
    Store(#[from] repomem_store::StoreError),

    /// LLM provider error (chat or embedding).
    #[error("LLM error: {0}")]
    Llm(#[from] repomem_llm::LlmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),

    /// The repository state could not be read; fatal to that repository's run.
    #[error("cannot plan repository {repo_id}: {message}")]
    Planning { repo_id: String, message: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path leaves the repository: {0}")]
    OutsideRepo(String),

    #[error("unknown repository: {0}")]
    UnknownRepo(String),

    /// Embeddings of one run must share a dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A spawned worker panicked or was aborted.
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
