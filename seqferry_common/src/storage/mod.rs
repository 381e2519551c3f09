//! Object storage backends.

use async_trait::async_trait;

use crate::prelude::*;

pub mod s3;

/// Abstract interface to the object store a run uploads into.
///
/// Implementations must be safe to share across the threads of one upload
/// worker; workers never share a client between themselves (each constructs
/// its own through [`ObjectStoreFactory`]).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the contents of `local_path` under `bucket`/`key`.
    async fn put_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()>;

    /// Fetch the stored object's content identifier (ETag), with any
    /// surrounding quote characters stripped.
    async fn get_object_etag(&self, bucket: &str, key: &str) -> Result<String>;

    /// Check that `bucket` exists and is reachable with our credentials.
    async fn head_bucket(&self, bucket: &str) -> Result<()>;

    /// List the buckets visible to our credentials. Used as a cheap
    /// authentication check at startup.
    async fn list_buckets(&self) -> Result<Vec<String>>;
}

/// Constructs one [`ObjectStore`] client per upload worker.
///
/// Client construction is separated from use so that each shard worker can
/// own its client while the factory itself is shared freely.
#[async_trait]
pub trait ObjectStoreFactory: Send + Sync {
    /// Build a fresh client.
    async fn connect(&self) -> Result<Arc<dyn ObjectStore>>;
}
