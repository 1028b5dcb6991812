//! Embedding clients.
//!
//! The fabric embeds chunk text and entity/relation content through one
//! trait. [`BatchedEmbedder`] wraps any provider with batch splitting and a
//! bounded number of in-flight batches; every returned vector is checked
//! against the configured dimension.

pub mod fastembed;
pub mod remote;

use crate::concurrency::bounded_map;
use crate::error::{FabricError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Batched async text embedding.
#[async_trait]
pub trait EmbeddingClient: Send + Sync + std::fmt::Debug {
    /// Length of every vector this client produces.
    fn embedding_dim(&self) -> usize;

    /// Embed `texts`, one vector per input, in order.
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

/// Splits inputs into batches of at most `batch_num` texts and runs up to
/// `max_async` batches concurrently against the inner provider.
pub struct BatchedEmbedder {
    inner: Arc<dyn EmbeddingClient>,
    batch_num: usize,
    max_async: usize,
}

impl std::fmt::Debug for BatchedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedEmbedder")
            .field("batch_num", &self.batch_num)
            .field("max_async", &self.max_async)
            .field("dim", &self.inner.embedding_dim())
            .finish()
    }
}

impl BatchedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingClient>, batch_num: usize, max_async: usize) -> Self {
        Self { inner, batch_num: batch_num.max(1), max_async: max_async.max(1) }
    }
}

#[async_trait]
impl EmbeddingClient for BatchedEmbedder {
    fn embedding_dim(&self) -> usize {
        self.inner.embedding_dim()
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batches: Vec<Vec<String>> = texts
            .chunks(self.batch_num)
            .map(|batch| batch.to_vec())
            .collect();

        let futures: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let inner = Arc::clone(&self.inner);
                async move { inner.embed(batch).await }
            })
            .collect();

        let dim = self.inner.embedding_dim();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in bounded_map(self.max_async, futures).await {
            for vector in batch? {
                if vector.len() != dim {
                    return Err(FabricError::SchemaMismatch(format!(
                        "embedding has {} dimensions, expected {dim}",
                        vector.len()
                    )));
                }
                vectors.push(vector);
            }
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingEmbedder {
        dim: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedder {
        fn embedding_dim(&self) -> usize {
            self.dim
        }

        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32; self.dim]).collect())
        }
    }

    #[tokio::test]
    async fn splits_into_batches_and_preserves_order() {
        let inner = Arc::new(CountingEmbedder { dim: 4, calls: AtomicUsize::new(0) });
        let embedder = BatchedEmbedder::new(Arc::clone(&inner) as Arc<dyn EmbeddingClient>, 3, 2);

        let texts: Vec<String> = (0..8).map(|i| "x".repeat(i + 1)).collect();
        let vectors = embedder.embed(texts).await.unwrap();

        assert_eq!(vectors.len(), 8);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
    }

    #[derive(Debug)]
    struct WrongDimEmbedder;

    #[async_trait]
    impl EmbeddingClient for WrongDimEmbedder {
        fn embedding_dim(&self) -> usize {
            8
        }

        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_is_schema_error() {
        let embedder = BatchedEmbedder::new(Arc::new(WrongDimEmbedder), 2, 2);
        let err = embedder.embed(vec!["a".into()]).await.unwrap_err();
        assert!(matches!(err, FabricError::SchemaMismatch(_)));
    }
}
