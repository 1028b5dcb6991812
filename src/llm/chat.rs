//! Chat-completions driver.
//!
//! Non-streaming completion against any OpenAI-compatible endpoint, with
//! the full resilience policy: 5 retry attempts with jittered exponential
//! backoff on 5xx/timeout, a per-endpoint circuit breaker that opens after
//! 5 consecutive server failures, and a request timeout that scales with
//! the consecutive-failure counter up to 4x.

use crate::error::{FabricError, Result};
use crate::llm::{CompletionRequest, LlmClient};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_ATTEMPTS: u32 = 5;
const BREAKER_THRESHOLD: u32 = 5;
const BASE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT_SCALE: u32 = 4;

/// Consecutive server-failure counter guarding one endpoint.
#[derive(Debug, Default)]
pub(crate) struct CircuitBreaker {
    consecutive: AtomicU32,
}

impl CircuitBreaker {
    pub(crate) fn is_open(&self) -> bool {
        self.consecutive.load(Ordering::Relaxed) >= BREAKER_THRESHOLD
    }

    pub(crate) fn record_failure(&self) {
        self.consecutive.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }

    /// Request timeout scaled by the failure streak, capped at 4x.
    pub(crate) fn scaled_timeout(&self) -> Duration {
        let streak = self.consecutive.load(Ordering::Relaxed);
        BASE_TIMEOUT * (1 + streak).min(MAX_TIMEOUT_SCALE)
    }
}

/// Connection settings for the configured chat endpoint. Any
/// OpenAI-compatible server works; authentication is a bearer key.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl ChatSettings {
    /// Completions URL of the endpoint, tolerant of a trailing slash on the
    /// configured base.
    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Chat-completions driver for the configured endpoint.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: ChatSettings,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl ChatCompletionsClient {
    #[must_use]
    pub fn new(settings: ChatSettings) -> Self {
        Self { http: reqwest::Client::new(), settings, breaker: CircuitBreaker::default() }
    }

    fn build_messages(request: &CompletionRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for turn in &request.history {
            messages.push(serde_json::json!({"role": turn.role, "content": turn.content}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));
        messages
    }

    async fn call_once(&self, request: &CompletionRequest) -> Result<String> {
        let url = self.settings.chat_url();

        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": false,
            "messages": Self::build_messages(request),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let mut rb = self
            .http
            .post(&url)
            .timeout(self.breaker.scaled_timeout())
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }

        let response = rb
            .send()
            .await
            .map_err(|e| FabricError::LlmTransient(format!("chat request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FabricError::LlmTransient(format!("chat endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(FabricError::UserInput(format!(
                "chat endpoint rejected the request: {status}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FabricError::LlmTransient(format!("bad chat payload: {e}")))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FabricError::LlmTransient("chat payload had no content".into()))
    }
}

#[async_trait::async_trait]
impl LlmClient for ChatCompletionsClient {
    fn model_id(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if self.breaker.is_open() {
            return Err(FabricError::LlmUnavailable);
        }

        let mut delay = Duration::from_millis(500);
        let mut attempt = 1;
        loop {
            match self.call_once(&request).await {
                Ok(text) => {
                    self.breaker.record_success();
                    debug!(name: "llm.complete", chars = text.len(), "completion received");
                    return Ok(text);
                }
                Err(e) if e.is_transient() => {
                    self.breaker.record_failure();
                    if self.breaker.is_open() {
                        warn!(name: "llm.breaker.open", error = %e, "circuit breaker opened");
                        return Err(FabricError::LlmUnavailable);
                    }
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(e);
                    }
                    let jitter = rand::thread_rng().gen_range(0..250);
                    warn!(name: "llm.retry", attempt, error = %e, "transient chat failure, retrying");
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_and_resets() {
        let breaker = CircuitBreaker::default();
        for _ in 0..BREAKER_THRESHOLD {
            assert!(!breaker.is_open());
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn timeout_scales_with_streak_up_to_cap() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.scaled_timeout(), BASE_TIMEOUT);
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.scaled_timeout(), BASE_TIMEOUT * MAX_TIMEOUT_SCALE);
    }

    #[test]
    fn chat_url_tolerates_trailing_slash() {
        let with_slash = ChatSettings {
            base_url: "http://localhost:8000/".into(),
            api_key: None,
            model: "m".into(),
        };
        let without = ChatSettings { base_url: "http://localhost:8000".into(), ..with_slash.clone() };
        assert_eq!(with_slash.chat_url(), "http://localhost:8000/v1/chat/completions");
        assert_eq!(without.chat_url(), with_slash.chat_url());
    }

    #[test]
    fn messages_include_system_history_and_prompt() {
        let request = CompletionRequest::new("question")
            .with_system("you are terse")
            .with_history(vec![crate::llm::HistoryMessage::user("earlier")]);
        let messages = ChatCompletionsClient::build_messages(&request);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "earlier");
        assert_eq!(messages[2]["content"], "question");
    }
}
