use std::str::FromStr;

use super::Config;

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key} value: {raw}");
            None
        }
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_backends();
        self.apply_env_overrides_pipeline();
    }

    fn apply_env_overrides_backends(&mut self) {
        if let Ok(v) = std::env::var("REPOMEM_LLM_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.llm.provider = kind;
            } else {
                tracing::warn!("ignoring invalid REPOMEM_LLM_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("REPOMEM_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("REPOMEM_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("REPOMEM_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("REPOMEM_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
    }

    fn apply_env_overrides_pipeline(&mut self) {
        if let Some(n) = parsed("REPOMEM_INDEX_CONCURRENCY") {
            self.indexer.concurrency = n;
        }
        if let Some(n) = parsed("REPOMEM_INDEX_EMBED_MAX_ATTEMPTS") {
            self.indexer.embed_max_attempts = n;
        }
        if let Some(enabled) = parsed("REPOMEM_INDEX_SUMMARIES") {
            self.indexer.summaries = enabled;
        }
        if let Some(n) = parsed("REPOMEM_CHUNKER_TARGET_CHARS") {
            self.chunker.target_chars = n;
        }
        if let Some(n) = parsed("REPOMEM_CHUNKER_MAX_FILE_BYTES") {
            self.chunker.max_file_bytes = n;
        }
        if let Some(n) = parsed("REPOMEM_CHUNKER_PREVIEW_CHARS") {
            self.chunker.preview_chars = n;
        }
        if let Some(enabled) = parsed("REPOMEM_ENRICHMENT_ENABLED") {
            self.enrichment.enabled = enabled;
        }
        if let Some(n) = parsed("REPOMEM_ENRICHMENT_LLM_MIN_CHARS") {
            self.enrichment.llm_min_chars = n;
        }
        if let Some(n) = parsed("REPOMEM_RETRIEVAL_MAX_K") {
            self.retrieval.max_k = n;
        }
        if let Some(n) = parsed("REPOMEM_RETRIEVAL_DEFAULT_K") {
            self.retrieval.default_k = n;
        }
        if let Some(boost) = parsed("REPOMEM_RETRIEVAL_LEXICAL_BOOST") {
            self.retrieval.lexical_boost = boost;
        }
        if let Some(n) = parsed("REPOMEM_EXPLORE_MAX_ITERATIONS") {
            self.explore.max_iterations = n;
        }
    }
}
