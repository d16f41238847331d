//! voicebot-core - reply generation for the voicebot server
//!
//! This crate provides:
//! - The [`Dispatcher`], which retries each configured provider with
//!   exponential backoff and fails over to the next one in priority order
//! - A Google Gemini provider behind the [`LlmProvider`] trait
//! - Persona-based prompt rendering
//! - The error taxonomy reported to HTTP callers

pub mod error;
pub mod prompt;
pub mod providers;

// Re-export main types for convenience
pub use error::{DispatchError, ProviderError};
pub use prompt::Persona;
pub use providers::{
    ChatResponse, Dispatched, Dispatcher, GenerationConfig, GoogleProvider, LlmProvider,
    RetryPolicy,
};
