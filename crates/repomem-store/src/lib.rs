//! Persisted chunk schema and the narrow store interface the indexer writes through.

pub mod error;
pub mod in_memory;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use in_memory::InMemoryChunkStore;
pub use sqlite::SqliteChunkStore;
pub use store::{
    BoxFuture, ChunkFilter, ChunkStore, ScoredChunk, cosine_similarity, sort_scored, tie_break,
};
pub use types::{
    Chunk, ChunkKind, EnrichmentLevel, EnrichmentRecord, IndexState, SchemaVersion, chunk_id,
};
