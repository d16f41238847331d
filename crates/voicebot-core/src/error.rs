//! Error taxonomy surfaced by the dispatcher

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// A single provider exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
}

/// Why a dispatch did not produce a reply
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Empty, whitespace-only or oversized input. No provider was contacted.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Every configured provider exhausted its retries
    #[error("all {} providers failed", .errors.len())]
    AllProvidersFailed {
        errors: Vec<ProviderError>,
        timestamp: DateTime<Utc>,
    },

    /// The overall deadline elapsed before any provider answered
    #[error("no reply within {after:?}")]
    Timeout { after: Duration },

    /// A fault outside the dispatch contract
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

impl DispatchError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest(reason.into())
    }

    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self::Unexpected(reason.into())
    }

    /// Per-provider failures, empty for every kind but `AllProvidersFailed`
    pub fn provider_errors(&self) -> &[ProviderError] {
        match self {
            Self::AllProvidersFailed { errors, .. } => errors,
            _ => &[],
        }
    }
}
