//! Provider-agnostic types for text generation backends

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sampling parameters sent with every generation request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            max_output_tokens: 200,
        }
    }
}

/// A generated reply from a single backend call
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub stop_reason: StopReason,
    pub usage: ChatUsage,
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    Safety,
    Unknown,
}

/// Token usage from a single API call
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A configured backend credential/model pair that can produce a reply
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Identifier reported to clients (e.g. "gemini-1")
    fn provider_name(&self) -> &str;

    /// Model identifier (e.g. "gemini-2.0-flash-lite")
    fn model(&self) -> &str;

    /// Whether a credential is present. Unconfigured providers show up in
    /// health reports but are never dispatched to.
    fn is_configured(&self) -> bool {
        true
    }

    /// Generate a reply for a fully rendered prompt
    async fn generate(&self, prompt: &str) -> Result<ChatResponse>;
}

impl StopReason {
    /// Map a Gemini `finishReason` string
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("STOP") | None => Self::EndTurn,
            Some("MAX_TOKENS") => Self::MaxTokens,
            Some("SAFETY") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => Self::Safety,
            Some(_) => Self::Unknown,
        }
    }

    /// Whether the reply was cut off by the output token limit
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::MaxTokens)
    }
}
