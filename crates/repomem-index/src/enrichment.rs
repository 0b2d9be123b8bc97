//! Enrichment policy: mechanical outline or model-written summary per chunk.

use std::sync::Arc;

use repomem_llm::LlmProvider;
use repomem_llm::LlmError;
use repomem_llm::provider::Message;
use repomem_store::{EnrichmentLevel, EnrichmentRecord, SchemaVersion};
use serde::{Deserialize, Serialize};

use crate::chunker::Candidate;
use crate::fingerprint::{estimate_tokens, truncate_chars};

const SUMMARY_SYSTEM_PROMPT: &str = "You write search-index summaries of source code. \
Describe in at most five sentences what the code does, its inputs, its outputs \
and its side effects. \
Mention identifiers by name. Never reproduce code.";

/// Enrichment configuration. Every threshold is tunable; none is a fixed constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Allow calls to the summarization backend.
    pub enabled: bool,
    /// Spans at least this long are summarized by the model.
    pub llm_min_chars: usize,
    /// Span characters sent to the model.
    pub llm_input_chars: usize,
    /// A span longer than this is too coarse to stand alone.
    pub underchunk_chars: usize,
    /// A chunk that swallowed this many nested definitions is too coarse.
    pub underchunk_symbols: usize,
    pub max_summary_chars: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            llm_min_chars: 800,
            llm_input_chars: 8000,
            underchunk_chars: 4000,
            underchunk_symbols: 6,
            max_summary_chars: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub level: EnrichmentLevel,
    pub coarse: bool,
    /// Estimated tokens to summarize the span with the model.
    pub cost_estimate: u32,
}

/// Decide the enrichment level for a candidate. Pure: the same candidate and
/// config always yield the same decision.
#[must_use]
pub fn decide(candidate: &Candidate, config: &EnrichmentConfig) -> Decision {
    let coarse = candidate.span_chars > config.underchunk_chars
        || (config.underchunk_symbols > 0 && candidate.nested_symbols >= config.underchunk_symbols);

    let wants_llm = config.enabled && (coarse || candidate.span_chars >= config.llm_min_chars);

    let tokens = candidate.span_chars.min(config.llm_input_chars) / 4;
    Decision {
        level: if wants_llm {
            EnrichmentLevel::LlmSummarized
        } else {
            EnrichmentLevel::Mechanical
        },
        coarse,
        cost_estimate: u32::try_from(tokens).unwrap_or(u32::MAX),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enriched {
    pub summary_text: String,
    pub record: EnrichmentRecord,
}

/// Applies [`decide`] and calls the summarization backend when required.
pub struct Enricher<P> {
    provider: Arc<P>,
    config: EnrichmentConfig,
}

impl<P: LlmProvider> Enricher<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EnrichmentConfig) -> Self {
        Self { provider, config }
    }

    #[must_use]
    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    /// Produce the summary and enrichment record for one candidate.
    ///
    /// Never fails: a backend error degrades the chunk to the mechanical
    /// outline with `underchunked = true`.
    pub async fn enrich(&self, file_path: &str, candidate: &Candidate, span: &str) -> Enriched {
        let decision = decide(candidate, &self.config);
        let record = |level, underchunked| EnrichmentRecord {
            schema_version: SchemaVersion::CURRENT,
            enrichment_level: level,
            cost_estimate: decision.cost_estimate,
            underchunked,
        };

        if decision.level == EnrichmentLevel::Mechanical {
            return Enriched {
                summary_text: candidate.outline.clone(),
                record: record(EnrichmentLevel::Mechanical, decision.coarse),
            };
        }

        match self.summarize(file_path, candidate, span).await {
            Ok(summary) => Enriched {
                summary_text: format!("{}\n{summary}", candidate.outline),
                record: record(EnrichmentLevel::LlmSummarized, false),
            },
            Err(e) => {
                tracing::warn!(
                    file = %file_path,
                    symbol = candidate.symbol_path.as_deref().unwrap_or("<file>"),
                    "summarization failed, keeping mechanical outline: {e}"
                );
                Enriched {
                    summary_text: candidate.outline.clone(),
                    record: record(EnrichmentLevel::Mechanical, true),
                }
            }
        }
    }

    async fn summarize(
        &self,
        file_path: &str,
        candidate: &Candidate,
        span: &str,
    ) -> Result<String, LlmError> {
        let mut header = format!("File: {file_path}");
        if let Some(symbol) = &candidate.symbol_path {
            header.push_str(&format!("\nSymbol: {symbol}"));
        }
        if let Some((start, end)) = candidate.line_range {
            header.push_str(&format!("\nLines: {start}-{end}"));
        }
        let input = truncate_chars(span, self.config.llm_input_chars);
        tracing::debug!(
            file = %file_path,
            tokens = estimate_tokens(input),
            "requesting summary"
        );

        let messages = [
            Message::system(SUMMARY_SYSTEM_PROMPT),
            Message::user(format!("{header}\n\n{input}")),
        ];
        let reply = self.provider.chat(&messages).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: self.provider.name().to_string(),
            });
        }
        Ok(truncate_chars(reply, self.config.max_summary_chars).to_string())
    }
}

#[cfg(test)]
mod tests {
    use repomem_llm::mock::MockProvider;
    use repomem_store::ChunkKind;

    use super::*;

    fn candidate(span_chars: usize, nested: usize) -> Candidate {
        Candidate {
            kind: ChunkKind::SymbolIndex,
            symbol_path: Some("Counter".into()),
            node_kind: "class_definition".into(),
            line_range: Some((1, 40)),
            preview: "class Counter:".into(),
            outline: "Class `Counter` in a.py: class Counter:".into(),
            content_hash: "h".into(),
            span_chars,
            nested_symbols: nested,
        }
    }

    fn enabled() -> EnrichmentConfig {
        EnrichmentConfig {
            enabled: true,
            ..EnrichmentConfig::default()
        }
    }

    #[test]
    fn small_chunk_is_mechanical() {
        let d = decide(&candidate(100, 0), &enabled());
        assert_eq!(d.level, EnrichmentLevel::Mechanical);
        assert!(!d.coarse);
        assert_eq!(d.cost_estimate, 25);
    }

    #[test]
    fn coarse_by_size_or_nesting() {
        let cfg = EnrichmentConfig::default();
        assert!(decide(&candidate(5000, 0), &cfg).coarse);
        assert!(decide(&candidate(100, 6), &cfg).coarse);
        assert!(!decide(&candidate(100, 5), &cfg).coarse);
    }

    #[test]
    fn disabled_never_asks_the_model() {
        let d = decide(&candidate(50_000, 20), &EnrichmentConfig::default());
        assert_eq!(d.level, EnrichmentLevel::Mechanical);
        assert!(d.coarse);
    }

    #[test]
    fn cost_is_capped_by_input_window() {
        let d = decide(&candidate(1_000_000, 0), &enabled());
        assert_eq!(d.cost_estimate, 2000);
    }

    #[test]
    fn decision_is_stable() {
        let c = candidate(900, 2);
        assert_eq!(decide(&c, &enabled()), decide(&c, &enabled()));
    }

    #[tokio::test]
    async fn mechanical_keeps_outline_and_flags_coarse() {
        let provider = Arc::new(MockProvider::default());
        let enricher = Enricher::new(Arc::clone(&provider), EnrichmentConfig::default());

        let out = enricher.enrich("a.py", &candidate(5000, 0), "class Counter: ...").await;
        assert_eq!(out.summary_text, "Class `Counter` in a.py: class Counter:");
        assert_eq!(out.record.enrichment_level, EnrichmentLevel::Mechanical);
        assert!(out.record.underchunked);
        assert_eq!(provider.chat_calls(), 0);
    }

    #[tokio::test]
    async fn large_span_is_summarized() {
        let provider = Arc::new(MockProvider::with_responses(vec![
            "Counts things and resets them.".into(),
        ]));
        let enricher = Enricher::new(Arc::clone(&provider), enabled());

        let out = enricher.enrich("a.py", &candidate(5000, 0), "class Counter: ...").await;
        assert_eq!(out.record.enrichment_level, EnrichmentLevel::LlmSummarized);
        assert!(!out.record.underchunked);
        assert!(out.summary_text.starts_with("Class `Counter`"));
        assert!(out.summary_text.ends_with("Counts things and resets them."));
        assert_eq!(out.record.schema_version, SchemaVersion::CURRENT);
        assert_eq!(provider.chat_calls(), 1);
    }

    #[tokio::test]
    async fn backend_failure_degrades() {
        let provider = Arc::new(MockProvider::chat_unavailable());
        let enricher = Enricher::new(provider, enabled());

        let out = enricher.enrich("a.py", &candidate(900, 0), "class Counter: ...").await;
        assert_eq!(out.record.enrichment_level, EnrichmentLevel::Mechanical);
        assert!(out.record.underchunked);
        assert_eq!(out.summary_text, "Class `Counter` in a.py: class Counter:");
    }

    #[tokio::test]
    async fn blank_reply_degrades() {
        let provider = Arc::new(MockProvider::with_responses(vec!["   ".into()]));
        let enricher = Enricher::new(provider, enabled());

        let out = enricher.enrich("a.py", &candidate(900, 0), "x").await;
        assert_eq!(out.record.enrichment_level, EnrichmentLevel::Mechanical);
        assert!(out.record.underchunked);
    }

    #[tokio::test]
    async fn summary_is_bounded() {
        let provider = Arc::new(MockProvider::with_responses(vec!["word ".repeat(1000)]));
        let cfg = EnrichmentConfig {
            max_summary_chars: 50,
            ..enabled()
        };
        let enricher = Enricher::new(provider, cfg);

        let out = enricher.enrich("a.py", &candidate(900, 0), "x").await;
        let outline_len = "Class `Counter` in a.py: class Counter:".len() + 1;
        assert!(out.summary_text.chars().count() <= outline_len + 50);
    }
}
