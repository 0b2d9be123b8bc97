use repomem_index::chunker::ChunkerConfig;
use repomem_index::enrichment::EnrichmentConfig;
use repomem_index::explore::ExploreConfig;
use repomem_index::indexer::{IndexerConfig, PipelineConfig};
use repomem_index::retriever::RetrievalConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub indexer: IndexerConfig,
    pub chunker: ChunkerConfig,
    pub enrichment: EnrichmentConfig,
    pub retrieval: RetrievalConfig,
    pub explore: ExploreConfig,
}

impl Config {
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            indexer: self.indexer.clone(),
            chunker: self.chunker.clone(),
            enrichment: self.enrichment.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    /// Deterministic in-process provider.
    #[cfg(feature = "mock")]
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            #[cfg(feature = "mock")]
            Self::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    /// Chat model used for span summaries and the explorer.
    pub model: String,
    pub embedding_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: "http://localhost:11434".into(),
            model: "qwen3:8b".into(),
            embedding_model: "qwen3-embedding".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `SQLite` database file, or `:memory:`.
    pub sqlite_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/repomem.db".into(),
        }
    }
}
