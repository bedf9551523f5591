pub mod ollama;
pub mod openai;
pub mod openrouter;
pub mod provider;
pub mod rate_limit;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;
pub use provider::{EmbeddingError, EmbeddingProvider, ProbeResult, ProviderLimits, ProviderRegistry};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiterStatus};
