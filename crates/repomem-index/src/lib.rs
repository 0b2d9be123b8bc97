//! Incremental indexing and hybrid retrieval over source repositories.
//!
//! Files are fingerprinted, parsed with tree-sitter into line-referenced
//! chunks, enriched with a mechanical or model-written summary, embedded
//! from that summary plus a bounded preview, and swapped into the store one
//! file at a time. Raw code bodies are never persisted.

pub mod chunker;
pub mod enrichment;
pub mod error;
pub mod explore;
pub mod fingerprint;
pub mod indexer;
pub mod languages;
pub mod planner;
pub(crate) mod retry;
pub mod retriever;
pub mod schema;
pub mod source;
pub(crate) mod splitter;
pub mod summary;
pub mod synth;
pub mod updater;
pub mod watcher;

pub use error::{IndexError, Result};
pub use retry::RetryPolicy;
