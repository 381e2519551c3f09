//! Support for AWS S3 storage using the native AWS SDK.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{retry::RetryConfig, BehaviorVersion};
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use aws_smithy_runtime_api::client::http::SharedHttpClient;

use super::{ObjectStore, ObjectStoreFactory};
use crate::prelude::*;

/// TCP keep-alive interval for connections to the store. Upload workers hold
/// connections open between files, and quiet connections through NAT or LB
/// hops get dropped without this.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Idle connections the pool may keep per host. Sized above the worst case
/// of `cores × threads` concurrent uploads so workers never wait on a
/// socket.
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 128;

/// Backend for talking to AWS S3 using the native AWS SDK.
///
/// Credentials are read through the standard AWS credential chain
/// (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`, shared
/// config/credentials files and optionally `AWS_ENDPOINT_URL` for
/// S3-compatible services like MinIO), with a named profile selected from
/// the shared files when one is given.
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Create a new `S3Storage` backend.
    ///
    /// The client is tuned for many small-to-medium uploads driven by our
    /// own worker tiers: a standard retry policy of up to 10 attempts, TCP
    /// keep-alive on, a generous connection pool, and a plain uncompressed
    /// `put_object` per file so the SDK adds no concurrency of its own.
    #[instrument(skip_all, level = "trace")]
    pub async fn connect(profile_name: Option<&str>) -> Result<S3Storage> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(10))
            .http_client(pooled_keepalive_http_client());
        if let Some(profile_name) = profile_name {
            loader = loader.profile_name(profile_name);
        }
        let config = loader.load().await;
        Ok(S3Storage {
            client: Client::new(&config),
        })
    }
}

/// Build the HTTP client the SDK runs over: TCP keep-alive at
/// [`TCP_KEEPALIVE`] and up to [`MAX_IDLE_CONNECTIONS_PER_HOST`] pooled
/// idle connections per host.
fn pooled_keepalive_http_client() -> SharedHttpClient {
    let mut connector = hyper::client::HttpConnector::new();
    connector.enforce_http(false);
    connector.set_keepalive(Some(TCP_KEEPALIVE));
    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);

    let mut hyper_builder = hyper::Client::builder();
    hyper_builder.pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST);
    HyperClientBuilder::new()
        .hyper_builder(hyper_builder)
        .build(https_connector)
}

impl fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Storage").finish()
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    #[instrument(skip_all, fields(bucket = %bucket, key = %key, local_path = %local_path.display()), level = "trace")]
    async fn put_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(local_path).await.with_context(|| {
            format!("failed to read local file {}", local_path.display())
        })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "failed to upload {} to s3://{bucket}/{key}",
                    local_path.display()
                )
            })?;

        Ok(())
    }

    #[instrument(skip_all, fields(bucket = %bucket, key = %key), level = "trace")]
    async fn get_object_etag(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to get object s3://{bucket}/{key}"))?;

        let etag = response
            .e_tag()
            .ok_or_else(|| format_err!("no ETag returned for s3://{bucket}/{key}"))?;
        Ok(etag.trim_matches('"').to_owned())
    }

    #[instrument(skip_all, fields(bucket = %bucket), level = "trace")]
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .with_context(|| format!("bucket {bucket} does not exist or is not accessible"))?;
        Ok(())
    }

    #[instrument(skip_all, level = "trace")]
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .list_buckets()
            .send()
            .await
            .context("could not connect to AWS with current credentials")?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(|name| name.to_owned()))
            .collect())
    }
}

/// Builds one [`S3Storage`] client per upload worker, all against the same
/// profile.
#[derive(Clone, Debug)]
pub struct S3StorageFactory {
    profile_name: Option<String>,
}

impl S3StorageFactory {
    /// Create a factory for the given named profile (or the default
    /// credential chain when `None`).
    pub fn new(profile_name: Option<&str>) -> S3StorageFactory {
        S3StorageFactory {
            profile_name: profile_name.map(|name| name.to_owned()),
        }
    }
}

#[async_trait]
impl ObjectStoreFactory for S3StorageFactory {
    async fn connect(&self) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(
            S3Storage::connect(self.profile_name.as_deref()).await?,
        ))
    }
}
