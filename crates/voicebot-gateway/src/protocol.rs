//! Gateway HTTP protocol: JSON bodies exchanged with the browser client

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use voicebot_core::ProviderError;

/// Client → Gateway chat request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Transcript or typed text. Missing and blank are both rejected.
    #[serde(default)]
    pub message: Option<String>,
}

/// Gateway → Client reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    /// Identifier of the provider that answered
    pub provider: String,
}

/// Error body for every non-200 chat response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Friendly, user-facing text
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FailureDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Diagnostics attached when every provider failed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    pub per_provider_errors: Vec<ProviderFailure>,
    pub timestamp: DateTime<Utc>,
}

/// One provider's final error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: String,
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Provider id → whether a credential is configured
    pub apis: BTreeMap<String, bool>,
}

// ── User-facing messages ──

pub mod messages {
    pub const MESSAGE_REQUIRED: &str = "Message is required";
    pub const INVALID_BODY: &str = "Request body must be JSON like {\"message\": \"...\"}";
    pub const ALL_PROVIDERS_FAILED: &str =
        "I'm having some technical difficulties right now. Please try again in a moment!";
    pub const TIMED_OUT: &str =
        "That took longer than expected. Please try again in a moment!";
    pub const UNEXPECTED: &str = "Sorry, something unexpected happened. Please try again!";
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_details(mut self, details: FailureDetails) -> Self {
        self.details = Some(details);
        self
    }
}

impl FailureDetails {
    pub fn new(errors: &[ProviderError], timestamp: DateTime<Utc>) -> Self {
        Self {
            per_provider_errors: errors.iter().map(ProviderFailure::from).collect(),
            timestamp,
        }
    }
}

impl From<&ProviderError> for ProviderFailure {
    fn from(err: &ProviderError) -> Self {
        Self {
            provider: err.provider.clone(),
            error: err.message.clone(),
        }
    }
}

impl HealthReport {
    pub fn ok(apis: BTreeMap<String, bool>) -> Self {
        Self {
            status: "ok".to_string(),
            timestamp: Utc::now(),
            apis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialize() {
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(req.message.as_deref(), Some("hello"));
    }

    #[test]
    fn test_request_missing_message() {
        let req: ChatRequest = serde_json::from_str("{}").unwrap();
        assert!(req.message.is_none());
    }

    #[test]
    fn test_reply_serialize() {
        let reply = ChatReply {
            response: "Hi!".to_string(),
            provider: "gemini-1".to_string(),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json, serde_json::json!({"response": "Hi!", "provider": "gemini-1"}));
    }

    #[test]
    fn test_bad_request_body_has_only_error() {
        let json = serde_json::to_string(&ErrorBody::new(messages::MESSAGE_REQUIRED)).unwrap();
        assert_eq!(json, r#"{"error":"Message is required"}"#);
    }

    #[test]
    fn test_failure_details_camel_case() {
        let errors = vec![
            ProviderError::new("gemini-1", "status 429"),
            ProviderError::new("gemini-2", "status 500"),
        ];
        let now = Utc::now();
        let body = ErrorBody::new(messages::ALL_PROVIDERS_FAILED)
            .with_details(FailureDetails::new(&errors, now));
        let json = serde_json::to_value(&body).unwrap();

        let per_provider = json["details"]["perProviderErrors"].as_array().unwrap();
        assert_eq!(per_provider.len(), 2);
        assert_eq!(per_provider[0]["provider"], "gemini-1");
        assert_eq!(per_provider[1]["error"], "status 500");
        assert!(json["details"]["timestamp"].is_string());
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn test_health_report_ok() {
        let mut apis = BTreeMap::new();
        apis.insert("gemini-1".to_string(), true);
        apis.insert("gemini-2".to_string(), false);
        let json = serde_json::to_value(HealthReport::ok(apis)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["apis"]["gemini-1"], true);
        assert_eq!(json["apis"]["gemini-2"], false);
    }
}
