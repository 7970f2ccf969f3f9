//! The job run inside each prefetch worker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::JobFailure;
use crate::prefetch::source::ContiguousDataSource;
use crate::store::KvBufferStore;
use crate::worker::{JobContext, JobHandler, LogLevel, WorkerInit};

/// Dependencies shared by every prefetch worker.
#[derive(Clone)]
pub struct PrefetchDeps {
    pub source: Arc<dyn ContiguousDataSource>,
    pub store: Arc<dyn KvBufferStore>,
}

/// Result of a completed prefetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefetchOutcome {
    pub id: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Pulls an item from the source in full, hashes it and stores it.
pub struct PrefetchHandler {
    deps: PrefetchDeps,
}

impl PrefetchHandler {
    pub fn new(deps: PrefetchDeps) -> Self {
        Self { deps }
    }

    /// Worker entry point: each worker gets its own handler over the
    /// shared dependencies.
    pub fn from_init(init: WorkerInit<PrefetchDeps>) -> Self {
        Self::new(init.shared.as_ref().clone())
    }
}

#[async_trait]
impl JobHandler for PrefetchHandler {
    type Job = String;
    type Output = PrefetchOutcome;

    async fn run(&self, id: String, ctx: &JobContext) -> Result<PrefetchOutcome, JobFailure> {
        ctx.log(LogLevel::Debug, format!("Prefetching {id}"));

        let data = self
            .deps
            .source
            .get_data(&id)
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?;

        let mut hasher = Sha256::new();
        let mut buffer = Vec::with_capacity(data.size.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        let mut stream = data.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| JobFailure::new(e.to_string()))?;
            hasher.update(&chunk);
            buffer.extend_from_slice(&chunk);
        }

        if let Some(expected) = data.size {
            if expected != buffer.len() as u64 {
                return Err(JobFailure::new(format!(
                    "{id}: expected {expected} bytes, received {}",
                    buffer.len()
                )));
            }
        }

        self.deps
            .store
            .set(&id, &buffer)
            .await
            .map_err(|e| JobFailure::new(e.to_string()))?;

        let outcome = PrefetchOutcome {
            id,
            size: buffer.len() as u64,
            sha256: hex::encode(hasher.finalize()),
        };
        ctx.log(
            LogLevel::Debug,
            format!("Prefetched {} ({} bytes)", outcome.id, outcome.size),
        );
        Ok(outcome)
    }
}
