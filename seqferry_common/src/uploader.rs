//! The two-tier concurrent uploader.
//!
//! A run's files arrive pre-split into shards. The outer tier runs one
//! worker task per shard, and each worker constructs its own object-store
//! client; clients are shared across the threads of a worker but never
//! between workers. The inner tier bounds how many uploads one worker keeps
//! in flight at once.
//!
//! A file that fails to upload is recorded and the rest of the shard carries
//! on; cross-invocation retry happens through the state log's partial-resume
//! mechanism rather than here. A worker that dies abnormally is fatal, but
//! only after the surviving workers' results have been collected.

use tokio::sync::Semaphore;

use crate::{
    prelude::*,
    storage::{ObjectStore, ObjectStoreFactory},
};

/// Where a run's files are uploaded to, and how local paths map to keys.
#[derive(Clone, Debug)]
pub struct UploadTarget {
    /// Destination bucket.
    pub bucket: String,
    /// Key prefix inside the bucket.
    pub remote_path: String,
    /// The leading portion of each local path that is dropped before joining
    /// the remainder to `remote_path`. For a monitored run this is the run
    /// directory's parent, so keys start with the run ID.
    pub parent_path: PathBuf,
}

/// The outcome of one upload attempt over a set of shards.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    /// Every file that uploaded, mapped to its ETag receipt.
    pub uploaded: BTreeMap<PathBuf, String>,
    /// Every file that failed.
    pub failed: Vec<PathBuf>,
}

impl UploadOutcome {
    fn merge(&mut self, other: UploadOutcome) {
        self.uploaded.extend(other.uploaded);
        self.failed.extend(other.failed);
    }
}

/// Uploads file shards concurrently against a shared client factory.
pub struct Uploader {
    store_factory: Arc<dyn ObjectStoreFactory>,
    threads: usize,
}

impl Uploader {
    /// Create an uploader running up to `threads` concurrent uploads per
    /// shard worker.
    pub fn new(store_factory: Arc<dyn ObjectStoreFactory>, threads: usize) -> Uploader {
        Uploader {
            store_factory,
            threads: threads.max(1),
        }
    }

    /// Upload every file of every shard to `target`.
    ///
    /// Always returns the merged per-file successes and failures, plus the
    /// first fatal worker error if any worker died without reporting its
    /// shard. The caller is expected to persist the outcome before
    /// propagating the error.
    #[instrument(skip_all, fields(bucket = %target.bucket, shards = shards.len()))]
    pub async fn upload_run(
        &self,
        shards: Vec<Vec<PathBuf>>,
        target: &UploadTarget,
    ) -> (UploadOutcome, Option<Error>) {
        let mut workers = vec![];
        for (worker, shard) in shards.into_iter().enumerate() {
            let factory = self.store_factory.clone();
            let target = target.clone();
            let threads = self.threads;
            workers.push(tokio::spawn(async move {
                upload_shard(factory, shard, target, threads, worker).await
            }));
        }

        let mut outcome = UploadOutcome::default();
        let mut fatal = None;
        for worker in workers {
            match worker.await {
                Ok(Ok(shard_outcome)) => outcome.merge(shard_outcome),
                Ok(Err(err)) => {
                    error!("upload worker failed: {:?}", err);
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    error!("upload worker died: {:?}", err);
                    fatal.get_or_insert(Error::new(err).context("upload worker died"));
                }
            }
        }
        (outcome, fatal)
    }
}

/// Upload one shard's files through one worker-owned client.
#[instrument(skip_all, fields(worker = worker, files = files.len()))]
async fn upload_shard(
    store_factory: Arc<dyn ObjectStoreFactory>,
    files: Vec<PathBuf>,
    target: UploadTarget,
    threads: usize,
    worker: usize,
) -> Result<UploadOutcome> {
    // One client per worker; threads within the worker share it.
    let store = store_factory
        .connect()
        .await
        .context("could not construct object store client for upload worker")?;

    let semaphore = Arc::new(Semaphore::new(threads));
    let mut uploads = vec![];
    for local_path in files {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("upload semaphore closed")?;
        let store = store.clone();
        let target = target.clone();
        uploads.push(tokio::spawn(async move {
            let _permit = permit;
            let result = upload_single_file(store.as_ref(), &target, &local_path).await;
            (local_path, result)
        }));
    }

    let mut outcome = UploadOutcome::default();
    for upload in uploads {
        let (local_path, result) = upload.await.context("upload task died")?;
        match result {
            Ok(etag) => {
                trace!("uploaded {}", local_path.display());
                outcome.uploaded.insert(local_path, etag);
            }
            Err(err) => {
                error!("failed to upload {}: {:?}", local_path.display(), err);
                outcome.failed.push(local_path);
            }
        }
    }
    Ok(outcome)
}

/// Upload one file and return its ETag receipt.
#[instrument(skip_all, fields(local_path = %local_path.display()), level = "debug")]
pub async fn upload_single_file(
    store: &dyn ObjectStore,
    target: &UploadTarget,
    local_path: &Path,
) -> Result<String> {
    let key = object_key(&target.remote_path, &target.parent_path, local_path);
    store.put_object(&target.bucket, &key, local_path).await?;
    // Fetch the object back to confirm receipt and record its identifier.
    let etag = store.get_object_etag(&target.bucket, &key).await?;
    Ok(etag.trim_matches('"').to_owned())
}

/// Compute the object key for a local file.
///
/// The `parent_path` prefix is stripped exactly once from the start of the
/// local path, the remainder is joined under `remote_path`, and the result
/// never carries a leading `/`.
pub fn object_key(remote_path: &str, parent_path: &Path, local_path: &Path) -> String {
    let local = local_path.to_string_lossy();
    let parent = parent_path.to_string_lossy();
    let relative = local
        .strip_prefix(parent.as_ref())
        .unwrap_or(&local)
        .trim_start_matches('/');
    let prefix = remote_path.trim_start_matches('/').trim_end_matches('/');
    if prefix.is_empty() {
        relative.to_owned()
    } else {
        format!("{}/{}", prefix, relative)
    }
}
