//! The `upload` subcommand: single-shot upload of one run directory.
//!
//! Operator-driven, so it deliberately takes no lock and keeps no upload
//! state; monitor mode owns both.

use std::fs;

use clap::Args;
use seqferry_common::{
    config::default_cores,
    discovery::{check_is_sequencing_run_dir, check_termination_file_exists},
    fileset::{get_sequencing_file_list, split_file_list_by_cores},
    prelude::*,
    storage::{s3::S3StorageFactory, ObjectStoreFactory},
    tracing_support,
    uploader::{UploadTarget, Uploader},
};

/// Command-line options for `upload`.
#[derive(Args, Debug)]
pub struct Opt {
    /// AWS profile to authenticate with.
    #[arg(long = "profile_name")]
    pub profile_name: String,

    /// The run directory to upload.
    #[arg(long = "local_path")]
    pub local_path: PathBuf,

    /// S3 bucket to upload to.
    #[arg(long = "bucket")]
    pub bucket: String,

    /// Remote path in the bucket to upload the run directory under.
    #[arg(long = "remote_path", default_value = "/")]
    pub remote_path: String,

    /// Skip checking that the directory is a completed sequencing run.
    #[arg(long = "skip_check")]
    pub skip_check: bool,

    /// Number of workers to split the files across. Defaults to the host's
    /// available parallelism.
    #[arg(long = "cores")]
    pub cores: Option<usize>,

    /// Number of concurrent uploads per worker.
    #[arg(long = "threads", default_value_t = 8)]
    pub threads: usize,
}

/// Upload one run directory.
pub async fn run(opt: &Opt) -> Result<()> {
    tracing_support::initialize_tracing();

    let factory: Arc<dyn ObjectStoreFactory> =
        Arc::new(S3StorageFactory::new(Some(&opt.profile_name)));
    let store = factory
        .connect()
        .await
        .context("could not construct object store client")?;
    store
        .list_buckets()
        .await
        .context("could not authenticate with AWS, check credentials are valid")?;
    store.head_bucket(&opt.bucket).await?;

    let local_path = fs::canonicalize(&opt.local_path).with_context(|| {
        format!("could not resolve provided path {}", opt.local_path.display())
    })?;

    if !opt.skip_check
        && (!check_is_sequencing_run_dir(&local_path)
            || !check_termination_file_exists(&local_path))
    {
        return Err(format_err!(
            "provided directory {} does not appear to be a complete sequencing \
             run, please check the provided path and try again",
            local_path.display()
        ));
    }

    let files = get_sequencing_file_list(&local_path, &[])?;
    let cores = opt.cores.unwrap_or_else(default_cores);
    let shards = split_file_list_by_cores(&files, cores);

    // Upload into the run directory itself: strip everything above it.
    let parent_path = local_path
        .parent()
        .ok_or_else(|| {
            format_err!("provided path {} has no parent directory", local_path.display())
        })?
        .to_path_buf();
    let target = UploadTarget {
        bucket: opt.bucket.clone(),
        remote_path: opt.remote_path.clone(),
        parent_path,
    };

    let uploader = Uploader::new(factory, opt.threads);
    let (outcome, fatal) = uploader.upload_run(shards, &target).await;
    if let Some(fatal) = fatal {
        return Err(fatal);
    }

    info!(
        "uploaded {} of {} files from {}",
        outcome.uploaded.len(),
        files.len(),
        local_path.display(),
    );
    if !outcome.failed.is_empty() {
        for failed in &outcome.failed {
            error!("failed to upload {}", failed.display());
        }
        return Err(format_err!(
            "{} files failed to upload from {}",
            outcome.failed.len(),
            local_path.display()
        ));
    }
    Ok(())
}
