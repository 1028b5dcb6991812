//! LLM client: completion contract, retrying driver, and the KV-backed
//! response cache.

pub mod cache;
pub mod chat;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One turn of prior conversation carried into a completion (the gleaning
/// loop replays the extraction exchange this way).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// A prompt/completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub history: Vec<HistoryMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Default::default() }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history = history;
        self
    }

    /// Canonical string of the history, used in cache keys.
    pub fn history_fingerprint(&self) -> String {
        self.history
            .iter()
            .map(|m| format!("{}:{}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Prompt in, completion text out.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// Identifier of the underlying model, part of every cache key.
    fn model_id(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Strip markdown code fences an LLM may wrap around structured output.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn history_fingerprint_is_order_sensitive() {
        let a = CompletionRequest::new("p").with_history(vec![
            HistoryMessage::user("1"),
            HistoryMessage::assistant("2"),
        ]);
        let b = CompletionRequest::new("p").with_history(vec![
            HistoryMessage::assistant("2"),
            HistoryMessage::user("1"),
        ]);
        assert_ne!(a.history_fingerprint(), b.history_fingerprint());
    }
}
