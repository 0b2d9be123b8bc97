//! Chunk schema shared by the indexer, the stores and the retriever.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const CHUNK_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x72, 0x65, 0x70, 0x6f, // "repo"
    0x6d, 0x65, 0x6d, 0x2d, // "mem-"
    0x63, 0x68, 0x75, 0x6e, // "chun"
    0x6b, 0x2d, 0x69, 0x64, // "k-id"
]);

/// What a chunk describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    RepoSummary,
    ModuleSummary,
    FileIndex,
    SymbolIndex,
}

impl ChunkKind {
    pub const ALL: [Self; 4] = [
        Self::RepoSummary,
        Self::ModuleSummary,
        Self::FileIndex,
        Self::SymbolIndex,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RepoSummary => "repo_summary",
            Self::ModuleSummary => "module_summary",
            Self::FileIndex => "file_index",
            Self::SymbolIndex => "symbol_index",
        }
    }

    /// File and symbol chunks are derived from exactly one source file.
    #[must_use]
    pub fn is_file_scoped(self) -> bool {
        matches!(self, Self::FileIndex | Self::SymbolIndex)
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StoreError::InvalidValue(format!("unknown chunk kind: {s}")))
    }
}

/// Version of the pipeline that produced a chunk.
///
/// `V1` chunks stored the full signature line as preview and carried no cost
/// estimate. `V2` bounds the preview and records the enrichment cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub const CURRENT: Self = Self::V2;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    #[must_use]
    pub fn is_current(self) -> bool {
        self == Self::CURRENT
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaVersion {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(StoreError::InvalidValue(format!(
                "unknown schema version: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentLevel {
    Mechanical,
    LlmSummarized,
}

impl EnrichmentLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mechanical => "mechanical",
            Self::LlmSummarized => "llm_summarized",
        }
    }
}

impl FromStr for EnrichmentLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mechanical" => Ok(Self::Mechanical),
            "llm_summarized" => Ok(Self::LlmSummarized),
            other => Err(StoreError::InvalidValue(format!(
                "unknown enrichment level: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub schema_version: SchemaVersion,
    pub enrichment_level: EnrichmentLevel,
    /// Estimated tokens needed to summarize the underlying span with a model.
    pub cost_estimate: u32,
    pub underchunked: bool,
}

/// The atom of the index. Never holds the referenced code body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub kind: ChunkKind,
    pub repo_id: String,
    pub file_path: String,
    pub symbol_path: Option<String>,
    pub commit_sha: String,
    /// 1-based inclusive line range into the source file.
    pub line_range: Option<(usize, usize)>,
    pub content_hash: String,
    pub summary_text: String,
    pub preview: String,
    pub embedding: Vec<f32>,
    pub enrichment: EnrichmentRecord,
}

impl Chunk {
    /// Characters of text persisted for this chunk.
    #[must_use]
    pub fn stored_text_len(&self) -> usize {
        self.summary_text.chars().count() + self.preview.chars().count()
    }
}

/// Stable chunk identity. The schema version is part of the identity so a
/// pipeline upgrade produces a new generation instead of mutating old rows.
#[must_use]
pub fn chunk_id(
    repo_id: &str,
    file_path: &str,
    symbol_path: Option<&str>,
    schema: SchemaVersion,
) -> String {
    let key = format!(
        "{repo_id}\u{1f}{file_path}\u{1f}{}\u{1f}{}",
        symbol_path.unwrap_or(""),
        schema.as_str()
    );
    uuid::Uuid::new_v5(&CHUNK_NAMESPACE, key.as_bytes()).to_string()
}

/// Per-file indexing bookkeeping owned by the change planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub repo_id: String,
    pub file_path: String,
    pub last_indexed_commit: String,
    pub content_hash: String,
    pub schema_version: SchemaVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_namespace_is_valid_uuid() {
        assert!(!CHUNK_NAMESPACE.is_nil());
    }

    #[test]
    fn chunk_id_is_stable_and_discriminating() {
        let a = chunk_id("r", "src/a.py", Some("Counter.bump"), SchemaVersion::V2);
        let b = chunk_id("r", "src/a.py", Some("Counter.bump"), SchemaVersion::V2);
        assert_eq!(a, b);
        assert_ne!(a, chunk_id("r", "src/a.py", None, SchemaVersion::V2));
        assert_ne!(
            a,
            chunk_id("r", "src/a.py", Some("Counter.bump"), SchemaVersion::V1)
        );
        assert_ne!(a, chunk_id("other", "src/a.py", Some("Counter.bump"), SchemaVersion::V2));
    }

    #[test]
    fn chunk_id_separator_prevents_ambiguity() {
        let a = chunk_id("r", "ab", Some("c"), SchemaVersion::V2);
        let b = chunk_id("r", "a", Some("bc"), SchemaVersion::V2);
        assert_ne!(a, b);
    }

    #[test]
    fn kind_roundtrips_through_str() {
        for kind in ChunkKind::ALL {
            assert_eq!(kind.as_str().parse::<ChunkKind>().unwrap(), kind);
        }
        assert!("function".parse::<ChunkKind>().is_err());
    }

    #[test]
    fn kind_serde_matches_as_str() {
        let json = serde_json::to_string(&ChunkKind::SymbolIndex).unwrap();
        assert_eq!(json, "\"symbol_index\"");
    }

    #[test]
    fn schema_ordering_and_current() {
        assert!(SchemaVersion::V1 < SchemaVersion::V2);
        assert!(SchemaVersion::CURRENT.is_current());
        assert!(!SchemaVersion::V1.is_current());
        assert_eq!("v1".parse::<SchemaVersion>().unwrap(), SchemaVersion::V1);
        assert!("v9".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn enrichment_level_parse() {
        assert_eq!(
            "llm_summarized".parse::<EnrichmentLevel>().unwrap(),
            EnrichmentLevel::LlmSummarized
        );
        assert!("llm".parse::<EnrichmentLevel>().is_err());
    }
}
