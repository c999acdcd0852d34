pub mod blob;
pub mod cache;
pub mod error;
pub mod models;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore, PgBlobStore};
pub use cache::{CacheConfig, EventCache, PersistOutcome};
pub use error::StorageError;
pub use sqlx::postgres::PgPool;

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connect to PostgreSQL with a small pool; the blob store issues one query at a time.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(4)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}
