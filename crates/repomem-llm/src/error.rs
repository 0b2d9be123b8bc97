#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable")]
    Unavailable,

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: String },

    #[error("request to {provider} failed: {message}")]
    Request { provider: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::Request { .. } | Self::EmptyResponse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
