//! In-process [`KvBufferStore`] backed by a hash map.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::KvBufferStore;

/// Volatile store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryKvStore {
    buffers: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.buffers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffers.read().await.is_empty()
    }
}

#[async_trait]
impl KvBufferStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.buffers.read().await.get(key).cloned())
    }

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.buffers.read().await.contains_key(key))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.buffers.write().await.remove(key);
        Ok(())
    }

    async fn set(&self, key: &str, buffer: &[u8]) -> Result<(), StoreError> {
        self.buffers
            .write()
            .await
            .insert(key.to_string(), buffer.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_operations() {
        let store = MemoryKvStore::new();
        assert!(store.is_empty().await);

        store.set("x", b"1").await.unwrap();
        store.set("x", b"2").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("x").await.unwrap(), Some(b"2".to_vec()));

        store.del("x").await.unwrap();
        assert!(!store.has("x").await.unwrap());
        assert_eq!(store.get("x").await.unwrap(), None);
    }
}
