//! Reply dispatch with per-provider retry and ordered failover

use anyhow::{Result, anyhow};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, ProviderError};
use crate::prompt::Persona;

use super::types::{ChatResponse, LlmProvider};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;

/// Fixed retry budget with pure exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per provider, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Attempts made against each provider. Zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Sleep inserted after failed attempt `attempt` (0-indexed): `base_delay × 2^attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Sum of every backoff a fully failing provider sleeps through
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.attempts().saturating_sub(1))
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Longest one provider can take when every attempt runs into
    /// `per_attempt` (the HTTP timeout) before failing
    pub fn provider_budget(&self, per_attempt: Duration) -> Duration {
        per_attempt
            .saturating_mul(self.attempts())
            .saturating_add(self.worst_case_wait())
    }
}

/// A successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub text: String,
    /// Identifier of the provider that produced the reply
    pub provider: String,
    pub model: String,
}

/// Call one provider until it succeeds or the retry budget is spent.
///
/// The last attempt's failure is returned rather than retried; that is what
/// lets the dispatcher move on to the next provider.
pub async fn call_with_retry(
    provider: &dyn LlmProvider,
    prompt: &str,
    policy: &RetryPolicy,
) -> Result<ChatResponse, ProviderError> {
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        debug!(
            "Trying provider {} ({}) attempt {}/{}",
            provider.provider_name(),
            provider.model(),
            attempt + 1,
            attempts,
        );

        match provider.generate(prompt).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                let err_str = format!("{:#}", e);
                warn!(
                    "Provider {} ({}) attempt {}/{} failed: {}",
                    provider.provider_name(),
                    provider.model(),
                    attempt + 1,
                    attempts,
                    err_str,
                );

                if attempt + 1 >= attempts {
                    return Err(ProviderError::new(provider.provider_name(), err_str));
                }

                let delay = policy.backoff(attempt);
                debug!("Backing off for {:?} before retry", delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Routes a user message through providers in priority order
pub struct Dispatcher {
    /// Providers in failover order (index 0 = primary)
    providers: Vec<Arc<dyn LlmProvider>>,
    retry: RetryPolicy,
    persona: Persona,
    max_message_chars: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.provider_names())
            .field("retry", &self.retry)
            .field("persona", &self.persona.name)
            .field("max_message_chars", &self.max_message_chars)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over providers in failover order
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(anyhow!("Dispatcher requires at least one provider"));
        }
        Ok(Self {
            providers,
            retry: RetryPolicy::default(),
            persona: Persona::default(),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_max_message_chars(mut self, max_message_chars: usize) -> Self {
        self.max_message_chars = max_message_chars;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Provider identifiers in failover order
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Reject input that must never reach a provider. Returns the trimmed message.
    pub fn validate<'a>(&self, message: &'a str) -> Result<&'a str, DispatchError> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(DispatchError::bad_request("Message is required"));
        }
        let chars = trimmed.chars().count();
        if chars > self.max_message_chars {
            return Err(DispatchError::bad_request(format!(
                "Message is too long ({} characters, limit is {})",
                chars, self.max_message_chars
            )));
        }
        Ok(trimmed)
    }

    /// Generate a reply, failing over to the next provider once a provider's
    /// retries are exhausted. Stops at the first success.
    pub async fn dispatch(&self, message: &str) -> Result<Dispatched, DispatchError> {
        let message = self.validate(message)?;
        let prompt = self.persona.render(message);
        let mut errors = Vec::with_capacity(self.providers.len());

        for (idx, provider) in self.providers.iter().enumerate() {
            match call_with_retry(provider.as_ref(), &prompt, &self.retry).await {
                Ok(response) => {
                    if idx > 0 {
                        info!(
                            "Request succeeded on failover provider {} ({})",
                            provider.provider_name(),
                            provider.model()
                        );
                    }
                    if response.stop_reason.is_truncated() {
                        debug!(
                            "Reply from {} hit the output token limit",
                            provider.provider_name()
                        );
                    }
                    return Ok(Dispatched {
                        text: response.text,
                        provider: provider.provider_name().to_string(),
                        model: provider.model().to_string(),
                    });
                }
                Err(e) => {
                    if let Some(next) = self.providers.get(idx + 1) {
                        info!(
                            "Failing over from {} to {}",
                            provider.provider_name(),
                            next.provider_name()
                        );
                    }
                    errors.push(e);
                }
            }
        }

        error!("All {} providers failed", errors.len());
        Err(DispatchError::AllProvidersFailed {
            errors,
            timestamp: Utc::now(),
        })
    }

    /// `dispatch` bounded by an overall deadline. An elapsed deadline drops
    /// whatever attempt or backoff is in flight.
    pub async fn dispatch_with_deadline(
        &self,
        message: &str,
        deadline: Duration,
    ) -> Result<Dispatched, DispatchError> {
        match tokio::time::timeout(deadline, self.dispatch(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Dispatch gave up after {:?}", deadline);
                Err(DispatchError::Timeout { after: deadline })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    use super::super::types::{ChatUsage, StopReason};

    /// Mock provider that fails a fixed number of times before succeeding
    struct ScriptedProvider {
        name: String,
        failures_before_success: u32,
        calls: AtomicU32,
        call_times: Mutex<Vec<Instant>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(name: &str, failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failures_before_success,
                calls: AtomicU32::new(0),
                call_times: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn always_fails(name: &str) -> Arc<Self> {
            Self::new(name, u32::MAX)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_name(&self) -> &str {
            &self.name
        }
        fn model(&self) -> &str {
            "test-model"
        }
        async fn generate(&self, prompt: &str) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            self.prompts.lock().unwrap().push(prompt.to_string());
            if n < self.failures_before_success {
                return Err(anyhow!("status 503: {} unavailable (call {})", self.name, n + 1));
            }
            Ok(ChatResponse {
                text: format!("from {}", self.name),
                stop_reason: StopReason::EndTurn,
                usage: ChatUsage::default(),
            })
        }
    }

    /// Mock provider that never answers
    struct HangingProvider;

    #[async_trait]
    impl LlmProvider for HangingProvider {
        fn provider_name(&self) -> &str {
            "hanging"
        }
        fn model(&self) -> &str {
            "slow-model"
        }
        async fn generate(&self, _prompt: &str) -> Result<ChatResponse> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(anyhow!("unreachable"))
        }
    }

    /// Mock provider whose every call runs into the HTTP timeout
    struct TimingOutProvider {
        after: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for TimingOutProvider {
        fn provider_name(&self) -> &str {
            "timing-out"
        }
        fn model(&self) -> &str {
            "slow-model"
        }
        async fn generate(&self, _prompt: &str) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.after).await;
            Err(anyhow!("operation timed out"))
        }
    }

    fn dispatcher(providers: &[&Arc<ScriptedProvider>]) -> Dispatcher {
        let providers: Vec<Arc<dyn LlmProvider>> = providers
            .iter()
            .map(|p| Arc::clone(*p) as Arc<dyn LlmProvider>)
            .collect();
        Dispatcher::new(providers).unwrap()
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_is_pure_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_millis(2000));
        assert_eq!(policy.backoff(0), Duration::from_millis(2000));
        assert_eq!(policy.backoff(1), Duration::from_millis(4000));
        assert_eq!(policy.backoff(2), Duration::from_millis(8000));
        assert_eq!(policy.backoff(3), Duration::from_millis(16000));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert_eq!(policy.backoff(64), Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_worst_case_wait() {
        assert_eq!(
            RetryPolicy::default().worst_case_wait(),
            Duration::from_millis(6000)
        );
        assert_eq!(
            RetryPolicy::new(1, Duration::from_millis(2000)).worst_case_wait(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_provider_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.provider_budget(Duration::from_secs(10)),
            Duration::from_secs(36)
        );
        assert_eq!(
            RetryPolicy::new(0, Duration::from_secs(2)).provider_budget(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_provider_still_fails_over_within_budget() {
        let http_timeout = Duration::from_secs(10);
        let slow = Arc::new(TimingOutProvider {
            after: http_timeout,
            calls: AtomicU32::new(0),
        });
        let backup = ScriptedProvider::new("backup", 0);
        let providers: Vec<Arc<dyn LlmProvider>> = vec![
            Arc::clone(&slow) as Arc<dyn LlmProvider>,
            Arc::clone(&backup) as Arc<dyn LlmProvider>,
        ];
        let dispatcher = Dispatcher::new(providers).unwrap();

        let deadline = dispatcher.retry_policy().provider_budget(http_timeout) * 2;
        let result = dispatcher
            .dispatch_with_deadline("hello", deadline)
            .await
            .unwrap();

        assert_eq!(result.provider, "backup");
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backup.calls(), 1);
    }

    #[test]
    fn test_zero_retries_means_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::from_millis(10)).attempts(), 1);
    }

    #[test]
    fn test_empty_providers_rejected() {
        assert!(Dispatcher::new(vec![]).is_err());
    }

    #[test]
    fn test_provider_names_in_order() {
        let a = ScriptedProvider::new("gemini-1", 0);
        let b = ScriptedProvider::new("gemini-2", 0);
        let d = dispatcher(&[&a, &b]);
        assert_eq!(d.provider_names(), vec!["gemini-1", "gemini-2"]);
        assert_eq!(d.provider_count(), 2);
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = ScriptedProvider::new("gemini-1", 0);
        let fallback = ScriptedProvider::new("gemini-2", 0);
        let d = dispatcher(&[&primary, &fallback]);

        let result = d.dispatch("hello").await.unwrap();
        assert_eq!(result.provider, "gemini-1");
        assert_eq!(result.text, "from gemini-1");
        assert_eq!(result.model, "test-model");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_after_retries_exhausted() {
        let primary = ScriptedProvider::always_fails("gemini-1");
        let fallback = ScriptedProvider::new("gemini-2", 0);
        let d = dispatcher(&[&primary, &fallback]);

        let result = d.dispatch("hello").await.unwrap();
        assert_eq!(result.provider, "gemini-2");
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_same_provider() {
        let primary = ScriptedProvider::new("gemini-1", 2);
        let fallback = ScriptedProvider::new("gemini-2", 0);
        let d = dispatcher(&[&primary, &fallback]);

        let result = d.dispatch("hello").await.unwrap();
        assert_eq!(result.provider, "gemini-1");
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_fail_in_order() {
        let a = ScriptedProvider::always_fails("gemini-1");
        let b = ScriptedProvider::always_fails("gemini-2");
        let d = dispatcher(&[&a, &b]);

        let err = d.dispatch("hello").await.unwrap_err();
        match &err {
            DispatchError::AllProvidersFailed { errors, .. } => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].provider, "gemini-1");
                assert_eq!(errors[1].provider, "gemini-2");
                // Only the final attempt's error is kept
                assert!(errors[0].message.contains("call 3"));
                assert!(errors[1].message.contains("call 3"));
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 3);
    }

    #[tokio::test]
    async fn test_blank_message_contacts_nobody() {
        let a = ScriptedProvider::new("gemini-1", 0);
        let d = dispatcher(&[&a]);

        for message in ["", "   ", "\n\t "] {
            let err = d.dispatch(message).await.unwrap_err();
            assert!(matches!(err, DispatchError::BadRequest(_)));
        }
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let a = ScriptedProvider::new("gemini-1", 0);
        let d = dispatcher(&[&a]).with_max_message_chars(5);

        let err = d.dispatch("too long").await.unwrap_err();
        assert!(err.to_string().contains("too long"));
        assert_eq!(a.calls(), 0);
        assert!(d.dispatch("  short  ").await.is_ok());
    }

    #[tokio::test]
    async fn test_prompt_carries_persona_and_trimmed_message() {
        let a = ScriptedProvider::new("gemini-1", 0);
        let d = dispatcher(&[&a]).with_persona(Persona::new("Adil", "You are Adil."));

        d.dispatch("  what's up?\n").await.unwrap();
        let prompts = a.prompts.lock().unwrap();
        assert_eq!(prompts[0], "You are Adil.\n\nUser: what's up?\nAdil:");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_timeline() {
        let primary = ScriptedProvider::always_fails("gemini-1");
        let fallback = ScriptedProvider::new("gemini-2", 0);
        let d = dispatcher(&[&primary, &fallback]);

        let start = Instant::now();
        d.dispatch("hello").await.unwrap();

        let offsets: Vec<u128> = primary
            .call_times
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_millis())
            .collect();
        let handoff = fallback.call_times.lock().unwrap()[0]
            .duration_since(start)
            .as_millis();

        let expected = [0u128, 2000, 6000];
        assert_eq!(offsets.len(), expected.len());
        for (got, want) in offsets.iter().zip(expected) {
            assert!(
                *got >= want && *got < want + 50,
                "attempt at {got}ms, expected ~{want}ms"
            );
        }
        assert!(
            (6000..6050).contains(&handoff),
            "fallback called at {handoff}ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_with_retry_respects_budget() {
        let p = ScriptedProvider::always_fails("gemini-1");
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let err = call_with_retry(p.as_ref(), "prompt", &policy).await.unwrap_err();
        assert_eq!(err.provider, "gemini-1");
        assert_eq!(p.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_turns_into_timeout() {
        let providers: Vec<Arc<dyn LlmProvider>> = vec![Arc::new(HangingProvider)];
        let d = Dispatcher::new(providers).unwrap();

        let err = d
            .dispatch_with_deadline("hello", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { after } if after == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_deadline_not_hit_passes_result_through() {
        let a = ScriptedProvider::new("gemini-1", 0);
        let d = dispatcher(&[&a]);
        let result = d
            .dispatch_with_deadline("hello", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.provider, "gemini-1");
    }
}
