//! libSQL backend for [`KvBufferStore`].
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::KvBufferStore;

/// libSQL key/value store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlKvStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlKvStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Key/value store opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let store = Self::from_database(db).await?;
        debug!("In-memory key/value store created");
        Ok(store)
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

#[async_trait]
impl KvBufferStore for LibSqlKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM kv_buffers WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("get {key}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<Vec<u8>>(0)
                .map(Some)
                .map_err(|e| StoreError::Query(format!("get {key}: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get {key}: {e}"))),
        }
    }

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM kv_buffers WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("has {key}: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(StoreError::Query(format!("has {key}: {e}"))),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv_buffers WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("del {key}: {e}")))?;
        Ok(())
    }

    async fn set(&self, key: &str, buffer: &[u8]) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO kv_buffers (key, value, size, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    size = excluded.size,
                    updated_at = excluded.updated_at",
                params![key, buffer.to_vec(), buffer.len() as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set {key}: {e}")))?;
        debug!(key, size = buffer.len(), "Stored buffer");
        Ok(())
    }
}
