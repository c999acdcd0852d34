//! Key/value blob persistence for the event cache snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::StorageError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the blob under `key`. Blobs over the store's quota are rejected
    /// with [`StorageError::QuotaExceeded`] and leave the previous value intact.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

fn check_quota(size: usize, limit: usize) -> Result<(), StorageError> {
    if size > limit {
        return Err(StorageError::QuotaExceeded { size, limit });
    }
    Ok(())
}

// ─── File store ─────────────────────────────────────────────────────────────

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        check_quota(bytes.len(), self.max_bytes)?;
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write-then-rename; readers never see a partial file.
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── PostgreSQL store ───────────────────────────────────────────────────────

/// Blobs kept in the `kv_blobs` table.
#[derive(Debug, Clone)]
pub struct PgBlobStore {
    pool: PgPool,
    max_bytes: usize,
}

impl PgBlobStore {
    pub fn new(pool: PgPool, max_bytes: usize) -> Self {
        Self { pool, max_bytes }
    }

    /// Create the backing table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_blobs (
                key         TEXT PRIMARY KEY,
                value       BYTEA NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for PgBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM kv_blobs WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        check_quota(bytes.len(), self.max_bytes)?;
        sqlx::query(
            r#"
            INSERT INTO kv_blobs (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_blobs WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ─── Memory store ───────────────────────────────────────────────────────────

/// Process-local store, used when nothing should touch disk.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    max_bytes: Option<usize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(max_bytes: usize) -> Self {
        Self {
            blobs: Mutex::default(),
            max_bytes: Some(max_bytes),
        }
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs().get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(limit) = self.max_bytes {
            check_quota(bytes.len(), limit)?;
        }
        self.blobs().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.blobs().remove(key);
        Ok(())
    }
}
