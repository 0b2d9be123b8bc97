//! Test-only mock provider with deterministic embeddings and failure injection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    pub default_response: String,
    /// Dimension of the hashed bag-of-words embedding.
    pub embedding_dim: usize,
    /// When set, every embedding request returns this vector.
    pub fixed_embedding: Option<Vec<f32>>,
    pub supports_embeddings: bool,
    pub fail_chat: bool,
    pub fail_embed: bool,
    /// Milliseconds to sleep before answering any request.
    pub delay_ms: u64,
    embed_failures_left: Arc<AtomicUsize>,
    chat_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock summary".into(),
            embedding_dim: 64,
            fixed_embedding: None,
            supports_embeddings: true,
            fail_chat: false,
            fail_embed: false,
            delay_ms: 0,
            embed_failures_left: Arc::new(AtomicUsize::new(0)),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    /// Provider whose chat endpoint is down while embeddings keep working.
    #[must_use]
    pub fn chat_unavailable() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Fail the next `n` embedding requests with a transient error.
    #[must_use]
    pub fn with_embed_failures(self, n: usize) -> Self {
        self.embed_failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push(response.into());
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
    }
}

impl LlmProvider for MockProvider {
    async fn chat(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_chat {
            return Err(LlmError::Unavailable);
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.default_response.clone())
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if !self.supports_embeddings {
            return Err(LlmError::EmbedUnsupported {
                provider: "mock".into(),
            });
        }
        if self.fail_embed {
            return Err(LlmError::Unavailable);
        }
        let consumed = self
            .embed_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(LlmError::Unavailable);
        }
        if let Some(fixed) = &self.fixed_embedding {
            return Ok(fixed.clone());
        }
        Ok(hashed_embedding(text, self.embedding_dim))
    }

    fn supports_embeddings(&self) -> bool {
        self.supports_embeddings
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}

/// Bag-of-words vector: every lowercase alphanumeric token bumps one bucket.
#[must_use]
pub fn hashed_embedding(text: &str, dim: usize) -> Vec<f32> {
    let dim = dim.max(1);
    let mut vector = vec![0.0f32; dim];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let hash = fnv1a(&token.to_lowercase());
        #[allow(clippy::cast_possible_truncation)]
        let bucket = (hash % dim as u64) as usize;
        vector[bucket] += 1.0;
    }
    vector
}

fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_then_default() {
        let provider = MockProvider::with_responses(vec!["first".into()]);
        let msgs = [Message::user("x")];
        assert_eq!(provider.chat(&msgs).await.unwrap(), "first");
        assert_eq!(provider.chat(&msgs).await.unwrap(), "mock summary");
        assert_eq!(provider.chat_calls(), 2);
    }

    #[tokio::test]
    async fn chat_unavailable_still_embeds() {
        let provider = MockProvider::chat_unavailable();
        assert!(matches!(
            provider.chat(&[Message::user("x")]).await,
            Err(LlmError::Unavailable)
        ));
        assert_eq!(provider.embed("counter").await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn embed_failures_are_consumed() {
        let provider = MockProvider::default().with_embed_failures(2);
        assert!(provider.embed("a").await.is_err());
        assert!(provider.embed("a").await.is_err());
        assert!(provider.embed("a").await.is_ok());
        assert_eq!(provider.embed_calls(), 3);
    }

    #[test]
    fn hashed_embedding_is_deterministic_and_token_based() {
        let a = hashed_embedding("increment the counter", 32);
        let b = hashed_embedding("increment the counter", 32);
        assert_eq!(a, b);
        let total: f32 = a.iter().sum();
        assert!((total - 3.0).abs() < f32::EPSILON);
        assert!(hashed_embedding("", 32).iter().all(|v| *v == 0.0));
    }
}
