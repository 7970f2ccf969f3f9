//! Data prefetching: pull items from an upstream source into the local
//! store on a bounded worker pool.

pub mod handler;
pub mod source;

use std::sync::Arc;

pub use handler::{PrefetchDeps, PrefetchHandler, PrefetchOutcome};
pub use source::{ByteStream, ContiguousData, ContiguousDataSource, HttpDataSource};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::store::KvBufferStore;
use crate::worker::{PoolStats, WorkerPool};

/// Queues prefetch jobs onto a [`WorkerPool`] of [`PrefetchHandler`]s.
#[derive(Clone)]
pub struct DataPrefetcher {
    pool: WorkerPool<PrefetchHandler>,
}

impl DataPrefetcher {
    pub fn new(
        config: PoolConfig,
        source: Arc<dyn ContiguousDataSource>,
        store: Arc<dyn KvBufferStore>,
    ) -> Self {
        let pool = WorkerPool::new(
            config,
            PrefetchHandler::from_init,
            PrefetchDeps { source, store },
        );
        Self { pool }
    }

    /// Fire and forget. The outcome is only logged.
    pub fn queue_prefetch(&self, id: impl Into<String>) {
        let id = id.into();
        tracing::debug!(id = %id, "Queueing item for prefetching");
        let job = self.pool.submit(id.clone());
        tokio::spawn(async move {
            match job.await {
                Ok(outcome) => tracing::debug!(
                    id = %outcome.id,
                    size = outcome.size,
                    sha256 = %outcome.sha256,
                    "Data item prefetched"
                ),
                Err(e) => tracing::error!(id = %id, error = %e, "Failed to prefetch data item"),
            }
        });
    }

    /// Prefetch `id` and wait for the result.
    pub async fn prefetch(&self, id: impl Into<String>) -> Result<PrefetchOutcome, PoolError> {
        self.pool.submit(id.into()).await
    }

    /// Resolve once every prefetch worker is online.
    pub async fn wait_online(&self) {
        self.pool.wait_online().await;
    }

    pub fn pending_count(&self) -> usize {
        self.pool.pending_count()
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        self.pool.stats().await
    }

    /// Stop the underlying pool. Queued jobs are rejected, running jobs get
    /// the pool's shutdown timeout to finish.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;
    use crate::error::FetchError;
    use crate::store::MemoryKvStore;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    /// Serves fixed chunk lists; an `Err` entry breaks the stream there.
    struct FixtureSource {
        items: HashMap<&'static str, (Option<u64>, Vec<Result<&'static [u8], &'static str>>)>,
    }

    #[async_trait]
    impl ContiguousDataSource for FixtureSource {
        async fn get_data(&self, id: &str) -> Result<ContiguousData, FetchError> {
            let Some((size, chunks)) = self.items.get(id) else {
                return Err(FetchError::Status {
                    id: id.to_string(),
                    status: 404,
                });
            };
            let id = id.to_string();
            let chunks: Vec<Result<Bytes, FetchError>> = chunks
                .iter()
                .map(|c| match c {
                    Ok(b) => Ok(Bytes::from_static(*b)),
                    Err(reason) => Err(FetchError::Stream {
                        id: id.clone(),
                        reason: reason.to_string(),
                    }),
                })
                .collect();
            Ok(ContiguousData {
                stream: futures::stream::iter(chunks).boxed(),
                size: *size,
            })
        }
    }

    fn fixture() -> (DataPrefetcher, Arc<MemoryKvStore>) {
        let mut items = HashMap::new();
        items.insert("hello", (Some(5), vec![Ok(&b"hel"[..]), Ok(&b"lo"[..])]));
        items.insert("unsized", (None, vec![Ok(&b"hello"[..])]));
        items.insert("broken", (None, vec![Ok(&b"par"[..]), Err("connection reset")]));
        items.insert("short", (Some(10), vec![Ok(&b"hello"[..])]));

        let store = Arc::new(MemoryKvStore::new());
        let prefetcher = DataPrefetcher::new(
            PoolConfig {
                worker_count: 2,
                tasks_per_worker: 2,
                shutdown_timeout: Duration::from_secs(1),
            },
            Arc::new(FixtureSource { items }),
            store.clone(),
        );
        (prefetcher, store)
    }

    #[tokio::test]
    async fn prefetch_hashes_and_stores() {
        let (prefetcher, store) = fixture();

        let outcome = prefetcher.prefetch("hello").await.unwrap();
        assert_eq!(outcome.size, 5);
        assert_eq!(outcome.sha256, HELLO_SHA256);
        assert_eq!(store.get("hello").await.unwrap(), Some(b"hello".to_vec()));

        let outcome = prefetcher.prefetch("unsized").await.unwrap();
        assert_eq!(outcome.sha256, HELLO_SHA256);
        prefetcher.shutdown().await;
    }

    #[tokio::test]
    async fn failures_reject_without_storing() {
        let (prefetcher, store) = fixture();

        for id in ["missing", "broken", "short"] {
            let err = prefetcher.prefetch(id).await.unwrap_err();
            assert!(matches!(err, PoolError::Job(_)), "{id}: {err}");
            assert!(!store.has(id).await.unwrap(), "{id} must not be stored");
        }

        // Job failures never take workers down.
        prefetcher.prefetch("hello").await.unwrap();
        prefetcher.wait_online().await;
        let stats = prefetcher.stats().await.unwrap();
        assert_eq!(stats.online(), 2);
        prefetcher.shutdown().await;
    }

    #[tokio::test]
    async fn queued_prefetch_lands_in_store() {
        let (prefetcher, store) = fixture();
        prefetcher.queue_prefetch("hello");
        prefetcher.queue_prefetch("missing");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.has("hello").await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queued prefetch never completed");
        prefetcher.shutdown().await;
    }

    #[tokio::test]
    async fn prefetch_after_shutdown_is_rejected() {
        let (prefetcher, _store) = fixture();
        prefetcher.shutdown().await;
        assert!(matches!(
            prefetcher.prefetch("hello").await,
            Err(PoolError::Closed)
        ));
    }
}
