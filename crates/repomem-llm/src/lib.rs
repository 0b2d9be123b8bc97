//! Provider abstraction for the two model-backed operations repomem needs:
//! embedding text and summarizing code spans.

pub mod any;
pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod provider;

pub use error::LlmError;
pub use provider::LlmProvider;
