pub mod batcher;
pub mod openai;
pub mod provider;
pub mod resilient;
pub mod service;

pub use batcher::{BatchLimits, CHARS_PER_TOKEN, estimate_tokens, truncate_to_tokens};
pub use openai::OpenAiProvider;
pub use provider::{EmbeddingError, EmbeddingProvider};
pub use resilient::{ResilientProvider, RetryConfig, is_retryable_error, wrap_resilient};
pub use service::{EmbeddingService, ServiceConfig};
