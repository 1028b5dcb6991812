//! Concurrency primitives shared by the pipeline stages.
//!
//! Bounded concurrent maps keep the embedding, LLM, and graph-write stages
//! inside their configured widths; keyed locks serialise writers of the same
//! record; the cancellation token is checked at every suspension point.

use crate::error::{FabricError, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Run every future with at most `limit` in flight, preserving input order.
pub async fn bounded_map<F, T>(limit: usize, futures: Vec<F>) -> Vec<T>
where
    F: Future<Output = T>,
{
    stream::iter(futures)
        .buffered(limit.max(1))
        .collect::<Vec<_>>()
        .await
}

/// Early-out when the shared cancellation signal has fired.
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(FabricError::Cancelled);
    }
    Ok(())
}

/// Per-key async mutexes. Locks are created on demand and shared by clones,
/// so two writers of the same node name, relation pair, or reco pair never
/// interleave.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("keyed lock registry poisoned");
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Canonical key for a relation or reco pair.
    pub fn pair_key(source: &str, target: &str) -> String {
        format!("{source}\u{1}{target}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_map_preserves_order() {
        let futs: Vec<_> = (0..20)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis((20 - i) as u64)).await;
                i
            })
            .collect();
        let out = bounded_map(4, futs).await;
        assert_eq!(out, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn keyed_locks_serialise_same_key() {
        let locks = KeyedLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("LE_COQUEMAR").await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("A").await;
        // Must not deadlock.
        let _b = locks.acquire("B").await;
    }

    #[test]
    fn cancellation_is_detected() {
        let token = CancellationToken::new();
        assert!(ensure_active(&token).is_ok());
        token.cancel();
        assert!(matches!(ensure_active(&token), Err(FabricError::Cancelled)));
    }
}
