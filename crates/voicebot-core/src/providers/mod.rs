//! Text generation backends and the dispatcher that fails over between them
//!
//! Providers implement the [`LlmProvider`] trait and are composed via
//! [`Dispatcher`], which retries each one with exponential backoff before
//! moving on to the next.

pub mod dispatcher;
pub mod google;
pub mod types;

pub use dispatcher::{Dispatched, Dispatcher, RetryPolicy, call_with_retry};
pub use google::GoogleProvider;
pub use types::{ChatResponse, ChatUsage, GenerationConfig, LlmProvider, StopReason};
