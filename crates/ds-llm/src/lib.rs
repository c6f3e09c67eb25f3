//! LLM provider abstraction for the pipeline engine.
//!
//! Provides the [`ChatProvider`] trait with full, strict-JSON, and
//! callback-streaming completion modes, an OpenRouter-compatible HTTP
//! provider, a mock provider for testing, and the partial-JSON repair
//! applied at the provider boundary.

pub mod mock;
pub mod openrouter;
pub mod provider;
pub mod repair;

pub use mock::MockChatProvider;
pub use openrouter::OpenRouterProvider;
pub use provider::{
    ChatError, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatResult, ChatRole,
};
pub use repair::repair_and_parse;
