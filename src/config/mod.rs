mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.base_url.trim().is_empty() {
            bail!("llm.base_url must not be empty");
        }
        if self.store.sqlite_path.trim().is_empty() {
            bail!("store.sqlite_path must not be empty");
        }
        if self.indexer.concurrency == 0 {
            bail!("indexer.concurrency must be at least 1");
        }
        if self.indexer.embed_max_attempts == 0 || self.indexer.write_max_attempts == 0 {
            bail!("indexer retry attempts must be at least 1");
        }
        if self.indexer.max_embed_chars == 0 {
            bail!("indexer.max_embed_chars must be at least 1");
        }

        let chunker = &self.chunker;
        if chunker.min_chars > chunker.target_chars || chunker.target_chars > chunker.max_chars {
            bail!(
                "chunker sizes must satisfy min_chars <= target_chars <= max_chars \
                 (got {} / {} / {})",
                chunker.min_chars,
                chunker.target_chars,
                chunker.max_chars
            );
        }
        if chunker.preview_chars == 0 {
            bail!("chunker.preview_chars must be at least 1");
        }
        if chunker.max_file_bytes == 0 {
            bail!("chunker.max_file_bytes must be at least 1");
        }

        if self.enrichment.llm_input_chars == 0 {
            bail!("enrichment.llm_input_chars must be at least 1");
        }

        let retrieval = &self.retrieval;
        if retrieval.max_k == 0 || retrieval.default_k == 0 || retrieval.default_k > retrieval.max_k
        {
            bail!(
                "retrieval.default_k must be in 1..={} (got {})",
                retrieval.max_k,
                retrieval.default_k
            );
        }
        if !retrieval.lexical_boost.is_finite() || retrieval.lexical_boost < 0.0 {
            bail!("retrieval.lexical_boost must be a non-negative number");
        }

        if self.explore.max_iterations == 0 {
            bail!("explore.max_iterations must be at least 1");
        }
        if self.explore.search_k == 0 || self.explore.search_k > retrieval.max_k {
            bail!("explore.search_k must be in 1..={}", retrieval.max_k);
        }
        Ok(())
    }
}
