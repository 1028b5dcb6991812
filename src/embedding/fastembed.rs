//! Local embedding provider on fastembed.
//!
//! The ONNX model is loaded once behind a mutex and moved into
//! `spawn_blocking` for each batch so the inference never blocks the
//! runtime; the model is handed back afterwards.

use crate::embedding::EmbeddingClient;
use crate::error::{FabricError, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// BGE-small output dimension.
pub const BGE_SMALL_DIM: usize = 384;

pub struct FastembedClient {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    dim: usize,
}

impl std::fmt::Debug for FastembedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastembedClient").field("dim", &self.dim).finish()
    }
}

impl FastembedClient {
    /// Load the default local model (BAAI/bge-small-en-v1.5).
    pub fn new(dim: usize) -> Result<Self> {
        if dim != BGE_SMALL_DIM {
            return Err(FabricError::Configuration(format!(
                "fastembed provider produces {BGE_SMALL_DIM}-d vectors, configured dim is {dim}"
            )));
        }
        info!(name: "embedding.fastembed.init", model = "BAAI/bge-small-en-v1.5", "loading local embedding model");
        let mut options = InitOptions::new(EmbeddingModel::BGESmallENV15);
        options.show_download_progress = false;
        let model = TextEmbedding::try_new(options)
            .map_err(|e| FabricError::Configuration(format!("fastembed init failed: {e}")))?;
        Ok(Self { model: Arc::new(Mutex::new(Some(model))), dim })
    }
}

#[async_trait]
impl EmbeddingClient for FastembedClient {
    fn embedding_dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.model.lock().await;
        let owned = guard
            .take()
            .ok_or_else(|| FabricError::LlmTransient("embedding model unavailable".into()))?;

        // Move the model into the blocking pool and take it back afterwards.
        let (result, returned) = tokio::task::spawn_blocking(move || {
            let mut model = owned;
            let out = model.embed(texts, None);
            (out, model)
        })
        .await
        .map_err(|e| FabricError::LlmTransient(format!("embedding task failed: {e}")))?;

        *guard = Some(returned);
        result.map_err(|e| FabricError::LlmTransient(format!("fastembed inference failed: {e}")))
    }
}
