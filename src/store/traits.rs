//! Backend-agnostic keyed byte store.

use async_trait::async_trait;

use crate::error::StoreError;

/// A keyed store of opaque byte buffers.
///
/// Implementations are shared between the HTTP surface and every prefetch
/// worker, so all methods take `&self`.
#[async_trait]
pub trait KvBufferStore: Send + Sync {
    /// The buffer stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn has(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Insert or replace the buffer under `key`.
    async fn set(&self, key: &str, buffer: &[u8]) -> Result<(), StoreError>;
}
