//! The per-run upload pipeline.
//!
//! For one run this enumerates the local files, drops anything a previous
//! invocation already uploaded, splits the remainder into shards, runs the
//! uploader and merges the results back into the run's state log. The state
//! log is written exactly once per invocation per run, after every shard has
//! finished.

use crate::{
    discovery::run_id_of,
    fileset::{get_sequencing_file_list, split_file_list_by_cores},
    prelude::*,
    state_log::{state_log_path, write_upload_state_to_log, StateRecord},
    uploader::{UploadTarget, Uploader},
};

/// Everything needed to upload one run.
#[derive(Clone, Debug)]
pub struct RunUploadPlan {
    /// The run directory.
    pub run_dir: PathBuf,
    /// The run's ID (the directory's name).
    pub run_id: String,
    /// Destination bucket and key prefix, and the local prefix to strip.
    pub target: UploadTarget,
    /// Local paths a previous invocation already uploaded.
    pub uploaded_files: BTreeSet<PathBuf>,
    /// File path regexes to leave out of the upload.
    pub exclude_patterns: Vec<String>,
}

impl RunUploadPlan {
    /// Build the plan for one discovered run.
    pub fn new(
        run_dir: &Path,
        bucket: &str,
        remote_path: &str,
        uploaded_files: BTreeSet<PathBuf>,
        exclude_patterns: &[String],
    ) -> Result<RunUploadPlan> {
        let run_id = run_id_of(run_dir)?;
        let parent_path = run_dir
            .parent()
            .ok_or_else(|| {
                format_err!("run path {} has no parent directory", run_dir.display())
            })?
            .to_path_buf();
        Ok(RunUploadPlan {
            run_dir: run_dir.to_path_buf(),
            run_id,
            target: UploadTarget {
                bucket: bucket.to_owned(),
                remote_path: remote_path.to_owned(),
                parent_path,
            },
            uploaded_files,
            exclude_patterns: exclude_patterns.to_vec(),
        })
    }
}

/// Drop the files a previous invocation already uploaded.
pub fn filter_uploaded_files(
    local_files: &[PathBuf],
    uploaded_files: &BTreeSet<PathBuf>,
) -> Vec<PathBuf> {
    local_files
        .iter()
        .filter(|path| !uploaded_files.contains(*path))
        .cloned()
        .collect()
}

/// Upload one run and record the outcome in its state log.
///
/// Returns the post-write state record. If an upload worker died abnormally
/// the surviving results are merged and written first, then the fatal error
/// is propagated; the next invocation resumes the run as partial.
#[instrument(skip_all, fields(run_id = %plan.run_id))]
pub async fn process_run(
    plan: &RunUploadPlan,
    uploader: &Uploader,
    cores: usize,
    log_dir: &Path,
) -> Result<StateRecord> {
    info!("beginning upload of run {}", plan.run_id);

    let all_run_files = get_sequencing_file_list(&plan.run_dir, &plan.exclude_patterns)?;
    let files_to_upload = filter_uploaded_files(&all_run_files, &plan.uploaded_files);
    if files_to_upload.len() < all_run_files.len() {
        info!(
            "{} of {} files already uploaded on a previous invocation",
            all_run_files.len() - files_to_upload.len(),
            all_run_files.len(),
        );
    }

    let shards = split_file_list_by_cores(&files_to_upload, cores);
    let (outcome, fatal) = uploader.upload_run(shards, &plan.target).await;

    let record = write_upload_state_to_log(
        &state_log_path(log_dir, &plan.run_id),
        &plan.run_id,
        &plan.run_dir,
        &all_run_files,
        &outcome.uploaded,
        &outcome.failed,
    )?;

    if let Some(fatal) = fatal {
        return Err(fatal.context(format!(
            "upload worker died while uploading run {}",
            plan.run_id
        )));
    }
    Ok(record)
}
