//! Remote embedding provider for OpenAI-compatible `/v1/embeddings`
//! endpoints.

use crate::embedding::EmbeddingClient;
use crate::error::{FabricError, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const RETRY_ATTEMPTS: u32 = 7;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Client for a hosted embedding endpoint. Transient failures (5xx, 429,
/// timeouts) are retried with jittered exponential backoff; other 4xx are
/// fatal to the caller's unit of work.
#[derive(Debug, Clone)]
pub struct RemoteEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
}

impl RemoteEmbeddingClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            dim,
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }

    async fn call_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let mut request = self.http.post(self.url()).timeout(REQUEST_TIMEOUT).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            FabricError::LlmTransient(format!("embedding request failed: {e}"))
        })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FabricError::LlmTransient(format!(
                "embedding endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(FabricError::SchemaMismatch(format!(
                "embedding endpoint rejected the request: {status}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| FabricError::LlmTransient(format!("bad embeddings payload: {e}")))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingClient for RemoteEmbeddingClient {
    fn embedding_dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut delay = Duration::from_millis(500);
        let mut attempt = 1;
        loop {
            match self.call_once(&texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    let jitter = rand::thread_rng().gen_range(0..250);
                    warn!(name: "embedding.retry", attempt, error = %e, "transient embedding failure, retrying");
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
