//! KV-backed completion cache.
//!
//! Wraps any [`LlmClient`] and caches responses in the `llm_cache`
//! namespace, keyed by the content hash of prompt, system, history, and
//! model id. Cache entries are immutable; last-writer-wins is safe because
//! keys are content-hashed.

use crate::error::Result;
use crate::ids::llm_cache_key;
use crate::llm::{CompletionRequest, LlmClient};
use crate::storage::{KvStore, NS_LLM_CACHE};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct CachedLlm {
    inner: Arc<dyn LlmClient>,
    kv: Arc<dyn KvStore>,
    enabled: bool,
}

impl std::fmt::Debug for CachedLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedLlm")
            .field("model", &self.inner.model_id())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl CachedLlm {
    pub fn new(inner: Arc<dyn LlmClient>, kv: Arc<dyn KvStore>, enabled: bool) -> Self {
        Self { inner, kv, enabled }
    }

    fn key_for(&self, request: &CompletionRequest) -> String {
        llm_cache_key(
            &request.prompt,
            request.system.as_deref().unwrap_or(""),
            &request.history_fingerprint(),
            self.inner.model_id(),
        )
    }
}

#[async_trait]
impl LlmClient for CachedLlm {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if !self.enabled {
            return self.inner.complete(request).await;
        }

        let key = self.key_for(&request);
        if let Some(hit) = self.kv.get_by_id(NS_LLM_CACHE, &key).await? {
            if let Some(text) = hit.get("return").and_then(|v| v.as_str()) {
                debug!(name: "llm.cache.hit", key = %key, "serving completion from cache");
                return Ok(text.to_string());
            }
        }

        let text = self.inner.complete(request).await?;
        self.kv
            .upsert(
                NS_LLM_CACHE,
                HashMap::from([(
                    key,
                    json!({"return": text, "model": self.inner.model_id()}),
                )]),
            )
            .await?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for CountingLlm {
        fn model_id(&self) -> &str {
            "test-model"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("echo:{}", request.prompt))
        }
    }

    #[tokio::test]
    async fn second_identical_call_is_served_from_cache() {
        let inner = Arc::new(CountingLlm { calls: AtomicUsize::new(0) });
        let kv = Arc::new(MemoryKvStore::new());
        let cached = CachedLlm::new(Arc::clone(&inner) as Arc<dyn LlmClient>, kv, true);

        let a = cached.complete(CompletionRequest::new("hi")).await.unwrap();
        let b = cached.complete(CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_history_misses_the_cache() {
        let inner = Arc::new(CountingLlm { calls: AtomicUsize::new(0) });
        let kv = Arc::new(MemoryKvStore::new());
        let cached = CachedLlm::new(Arc::clone(&inner) as Arc<dyn LlmClient>, kv, true);

        cached.complete(CompletionRequest::new("hi")).await.unwrap();
        cached
            .complete(
                CompletionRequest::new("hi")
                    .with_history(vec![crate::llm::HistoryMessage::user("context")]),
            )
            .await
            .unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_cache_always_calls_through() {
        let inner = Arc::new(CountingLlm { calls: AtomicUsize::new(0) });
        let kv = Arc::new(MemoryKvStore::new());
        let cached = CachedLlm::new(Arc::clone(&inner) as Arc<dyn LlmClient>, kv, false);

        cached.complete(CompletionRequest::new("hi")).await.unwrap();
        cached.complete(CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
