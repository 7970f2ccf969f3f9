//! Persistence layer: keyed byte buffers for prefetched content.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

use std::sync::Arc;

pub use libsql_backend::LibSqlKvStore;
pub use memory::MemoryKvStore;
pub use traits::KvBufferStore;

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Open the store described by `config`: a libSQL file when a path is set,
/// otherwise an in-memory map.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn KvBufferStore>, StoreError> {
    match &config.path {
        Some(path) => Ok(Arc::new(LibSqlKvStore::new_local(path).await?)),
        None => {
            tracing::warn!("No store path configured, prefetched data will not persist");
            Ok(Arc::new(MemoryKvStore::new()))
        }
    }
}
