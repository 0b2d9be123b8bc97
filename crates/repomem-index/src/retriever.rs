//! Hybrid retrieval: structural filters, lexical match and vector similarity.

use std::fmt::Write;
use std::sync::Arc;

use repomem_llm::LlmProvider;
use repomem_store::{
    ChunkFilter, ChunkKind, ChunkStore, ScoredChunk, cosine_similarity, sort_scored,
};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::synth::Synthesizer;

/// How query text takes part when a query vector is present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LexicalMode {
    /// Text narrows the candidate set before distances are computed.
    #[default]
    Filter,
    /// Text only adds a bonus to the vector score.
    Boost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub type_filter: Option<ChunkKind>,
    pub repo_id: Option<String>,
    pub k: usize,
    pub lexical: LexicalMode,
}

impl SearchQuery {
    #[must_use]
    pub fn text(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: Some(text.into()),
            vector: None,
            type_filter: None,
            repo_id: None,
            k,
            lexical: LexicalMode::Filter,
        }
    }

    #[must_use]
    pub fn vector(vector: Vec<f32>, k: usize) -> Self {
        Self {
            text: None,
            vector: Some(vector),
            type_filter: None,
            repo_id: None,
            k,
            lexical: LexicalMode::Filter,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: ChunkKind) -> Self {
        self.type_filter = Some(kind);
        self
    }

    #[must_use]
    pub fn in_repo(mut self, repo_id: impl Into<String>) -> Self {
        self.repo_id = Some(repo_id.into());
        self
    }

    #[must_use]
    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    #[must_use]
    pub fn with_lexical(mut self, mode: LexicalMode) -> Self {
        self.lexical = mode;
        self
    }
}

/// One ranked hit. Carries the line reference and summary, never code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub score: f32,
    pub file_path: String,
    pub repo_id: String,
    pub kind: ChunkKind,
    pub symbol_path: Option<String>,
    pub line_range: Option<(usize, usize)>,
    pub summary_text: String,
}

impl From<ScoredChunk> for SearchResult {
    fn from(scored: ScoredChunk) -> Self {
        let c = scored.chunk;
        Self {
            chunk_id: c.chunk_id,
            score: scored.score,
            file_path: c.file_path,
            repo_id: c.repo_id,
            kind: c.kind,
            symbol_path: c.symbol_path,
            line_range: c.line_range,
            summary_text: c.summary_text,
        }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Requests asking for more results are rejected.
    pub max_k: usize,
    pub default_k: usize,
    /// Weight of the lexical score in [`LexicalMode::Boost`].
    pub lexical_boost: f32,
    /// Embed query text when the query carries no vector.
    pub derive_query_vectors: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_k: 50,
            default_k: 10,
            lexical_boost: 0.1,
            derive_query_vectors: true,
        }
    }
}

/// Read-only search over a [`ChunkStore`].
pub struct HybridRetriever<P> {
    store: Arc<dyn ChunkStore>,
    synth: Option<Synthesizer<P>>,
    config: RetrievalConfig,
}

impl<P: LlmProvider> HybridRetriever<P> {
    /// Text-only retriever; add a synthesizer to derive query vectors.
    #[must_use]
    pub fn new(store: Arc<dyn ChunkStore>, config: RetrievalConfig) -> Self {
        Self {
            store,
            synth: None,
            config,
        }
    }

    #[must_use]
    pub fn with_synthesizer(mut self, synth: Synthesizer<P>) -> Self {
        self.synth = Some(synth);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Rank chunks for `query`, best first.
    ///
    /// The type and repository filters always apply. With a vector, the
    /// lexical filter (in [`LexicalMode::Filter`]) narrows the candidates
    /// before distance ranking, so the top `k` comes from the filtered set.
    /// Without one, candidates are ranked by lexical relevance.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidQuery`] if `k` is out of range or the
    /// query has neither text nor vector, or a store error.
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>> {
        let k = query.k;
        if k == 0 || k > self.config.max_k {
            return Err(IndexError::InvalidQuery(format!(
                "k must be between 1 and {}, got {k}",
                self.config.max_k
            )));
        }

        let needle = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let filter = ChunkFilter {
            repo_id: query.repo_id,
            kind: query.type_filter,
            file_path: None,
            text: None,
        };

        let vector = match (query.vector, &needle) {
            (Some(v), _) => Some(v),
            (None, Some(text)) => self.derive_vector(text).await,
            (None, None) => None,
        };

        let scored = match (vector, needle) {
            (None, None) => {
                return Err(IndexError::InvalidQuery(
                    "query needs text or a vector".into(),
                ));
            }
            (Some(vector), None) => self.store.nearest(vector, filter, k).await?,
            (Some(vector), Some(text)) => match query.lexical {
                LexicalMode::Filter => {
                    self.store
                        .nearest(vector, filter.with_text(text), k)
                        .await?
                }
                LexicalMode::Boost => {
                    let candidates = self.store.query(filter).await?;
                    let mut scored: Vec<ScoredChunk> = candidates
                        .into_iter()
                        .map(|chunk| {
                            let lexical = lexical_score(&chunk.summary_text, &text);
                            let score = cosine_similarity(&vector, &chunk.embedding)
                                + self.config.lexical_boost * lexical;
                            ScoredChunk { chunk, score }
                        })
                        .collect();
                    sort_scored(&mut scored);
                    scored.truncate(k);
                    scored
                }
            },
            (None, Some(text)) => {
                let candidates = self.store.query(filter.with_text(text.clone())).await?;
                let mut scored: Vec<ScoredChunk> = candidates
                    .into_iter()
                    .map(|chunk| {
                        let score = lexical_score(&chunk.summary_text, &text);
                        ScoredChunk { chunk, score }
                    })
                    .collect();
                sort_scored(&mut scored);
                scored.truncate(k);
                scored
            }
        };

        tracing::debug!(hits = scored.len(), k, "search finished");
        Ok(scored.into_iter().map(SearchResult::from).collect())
    }

    async fn derive_vector(&self, text: &str) -> Option<Vec<f32>> {
        if !self.config.derive_query_vectors {
            return None;
        }
        let synth = self.synth.as_ref()?;
        match synth.embed_query(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("query embedding failed, falling back to text search: {e}");
                None
            }
        }
    }
}

/// Occurrence count of `needle` in `text` plus a bonus for an early first
/// match. Case-insensitive; zero when absent.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn lexical_score(text: &str, needle: &str) -> f32 {
    let haystack = text.to_ascii_lowercase();
    let needle = needle.trim().to_ascii_lowercase();
    if needle.is_empty() || haystack.is_empty() {
        return 0.0;
    }
    let count = haystack.matches(needle.as_str()).count();
    let Some(first) = haystack.find(needle.as_str()) else {
        return 0.0;
    };
    count as f32 + (1.0 - first as f32 / haystack.len() as f32)
}

/// Render results as a line-referenced context block for a prompt.
#[must_use]
pub fn format_as_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return String::new();
    }

    let mut out = String::from("<code_context>\n");
    for r in results {
        let lines = r
            .line_range
            .map_or_else(String::new, |(s, e)| format!(" lines=\"{s}-{e}\""));
        let symbol = r
            .symbol_path
            .as_deref()
            .map_or_else(String::new, |s| format!(" symbol=\"{s}\""));
        let _ = writeln!(
            out,
            "  <chunk repo=\"{}\" file=\"{}\" kind=\"{}\"{lines}{symbol} score=\"{:.2}\">",
            r.repo_id, r.file_path, r.kind, r.score,
        );
        out.push_str(&r.summary_text);
        out.push_str("\n  </chunk>\n");
    }
    out.push_str("</code_context>");
    out
}
