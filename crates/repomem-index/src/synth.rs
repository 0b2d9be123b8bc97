//! Embedding synthesis: summary plus bounded preview, never a code body.

use std::sync::{Arc, OnceLock};

use repomem_llm::{LlmError, LlmProvider};

use crate::error::{IndexError, Result};
use crate::fingerprint::truncate_chars;
use crate::retry::{RetryPolicy, with_retry};

/// The exact text handed to the embedding function for a chunk.
#[must_use]
pub fn embedding_text(summary: &str, preview: &str, max_chars: usize) -> String {
    let joined = if preview.is_empty() {
        summary.to_string()
    } else {
        format!("{summary}\n{preview}")
    };
    truncate_chars(&joined, max_chars).to_string()
}

/// Scale to unit L2 norm. A zero vector is left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub struct Synthesizer<P> {
    provider: Arc<P>,
    policy: RetryPolicy,
    max_embed_chars: usize,
    dimension: Arc<OnceLock<usize>>,
}

impl<P> Clone for Synthesizer<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            policy: self.policy,
            max_embed_chars: self.max_embed_chars,
            dimension: Arc::clone(&self.dimension),
        }
    }
}

impl<P: LlmProvider> Synthesizer<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, policy: RetryPolicy, max_embed_chars: usize) -> Self {
        Self {
            provider,
            policy,
            max_embed_chars,
            dimension: Arc::new(OnceLock::new()),
        }
    }

    /// Embed a chunk's `summary_text` and `preview`.
    ///
    /// # Errors
    ///
    /// Returns an error once transient failures exhaust the retry budget, on
    /// a permanent provider error, or when the vector dimension differs from
    /// earlier vectors produced by this synthesizer.
    pub async fn synthesize(&self, summary: &str, preview: &str) -> Result<Vec<f32>> {
        let text = embedding_text(summary, preview, self.max_embed_chars);
        self.embed(&text).await
    }

    /// Embed free-form query text with the same normalization as chunks.
    ///
    /// # Errors
    ///
    /// Same as [`Synthesizer::synthesize`].
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(truncate_chars(text, self.max_embed_chars)).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = with_retry("embedding", self.policy, LlmError::is_transient, || {
            self.provider.embed(text)
        })
        .await?;

        if vector.is_empty() {
            return Err(IndexError::Llm(LlmError::EmptyResponse {
                provider: self.provider.name().to_string(),
            }));
        }
        let expected = *self.dimension.get_or_init(|| vector.len());
        if expected != vector.len() {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        normalize(&mut vector);
        Ok(vector)
    }
}
