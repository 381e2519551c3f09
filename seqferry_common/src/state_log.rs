//! Per-run durable upload state.
//!
//! One JSON `StateRecord` per run, kept under `<log_dir>/uploads/`, is the
//! single source of truth for what has already been uploaded. Monitor-mode
//! discovery reads it to decide whether a run is new, partially uploaded or
//! done, and the orchestrator merges each attempt's results back into it.
//! The remote store is never listed to make this decision.

use std::fs;

use crate::prelude::*;

/// Subdirectory of the log dir holding one state log per run.
pub const UPLOADS_SUBDIR: &str = "uploads";

/// Durable record of a run's upload progress.
///
/// Keys and types are stable; external consumers parse these files.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StateRecord {
    /// ID of the sequencing run (the run directory's name).
    pub run_id: String,
    /// Full local path to the run directory.
    pub run_path: PathBuf,
    /// True once every local file has uploaded and nothing failed.
    pub completed: bool,
    /// Count of local files belonging to the run.
    pub total_local_files: usize,
    /// Count of files uploaded so far, across all attempts.
    pub total_uploaded_files: usize,
    /// Count of files that failed in the most recent attempt.
    pub total_failed_upload: usize,
    /// The files that failed in the most recent attempt.
    pub failed_upload_files: Vec<PathBuf>,
    /// Every uploaded file, mapped to the ETag the store returned for it.
    pub uploaded_files: BTreeMap<PathBuf, String>,
}

/// How far along a run's upload is, according to its state log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// No state log (or an unreadable one): nothing confirmed uploaded.
    New,
    /// Some files confirmed uploaded, but the run is not complete.
    Partial(BTreeSet<PathBuf>),
    /// The run finished uploading; never upload it again.
    Uploaded,
}

/// Path of the state log for `run_id` under `log_dir`.
pub fn state_log_path(log_dir: &Path, run_id: &str) -> PathBuf {
    log_dir
        .join(UPLOADS_SUBDIR)
        .join(format!("{}.upload.log.json", run_id))
}

/// Read a run's state log.
///
/// Fails if the file is missing or does not parse.
#[instrument(skip_all, fields(log_file = %log_file.display()))]
pub fn read_upload_state_log(log_file: &Path) -> Result<StateRecord> {
    debug!("reading upload state from log file {}", log_file.display());
    let contents = fs::read_to_string(log_file)
        .with_context(|| format!("could not read upload state log {}", log_file.display()))?;
    let record = serde_json::from_str::<StateRecord>(&contents)
        .with_context(|| format!("could not parse upload state log {}", log_file.display()))?;

    if record.completed {
        debug!("state of run {}: finished upload", record.run_id);
    } else {
        debug!(
            "state of run {}: incomplete upload | total local files: {} | total \
             uploaded files: {} | total failed upload: {} | total files to upload: {}",
            record.run_id,
            record.total_local_files,
            record.total_uploaded_files,
            record.total_failed_upload,
            record.total_local_files.saturating_sub(record.total_uploaded_files),
        );
    }

    Ok(record)
}

/// Classify a run's upload state from its state log.
///
/// A missing log means the run has never been (durably) uploaded. A log that
/// fails to parse is treated the same way: the upload is idempotent, so the
/// worst case is re-uploading objects the store already has.
pub fn classify_from_log(log_file: &Path) -> UploadState {
    if !log_file.exists() {
        return UploadState::New;
    }
    match read_upload_state_log(log_file) {
        Ok(record) if record.completed => UploadState::Uploaded,
        Ok(record) => {
            UploadState::Partial(record.uploaded_files.into_keys().collect())
        }
        Err(err) => {
            warn!(
                "treating unreadable upload state log {} as never uploaded: {:?}",
                log_file.display(),
                err
            );
            UploadState::New
        }
    }
}

/// Merge one upload attempt's results into the run's state log and write it
/// back atomically.
///
/// Successes accumulate across attempts (a fresh ETag wins on collision);
/// failures are only ever the most recent attempt's. The `completed` flag is
/// terminal: once set it stays set.
#[instrument(skip_all, fields(run_id = run_id))]
pub fn write_upload_state_to_log(
    log_file: &Path,
    run_id: &str,
    run_path: &Path,
    local_files: &[PathBuf],
    uploaded_files: &BTreeMap<PathBuf, String>,
    failed_files: &[PathBuf],
) -> Result<StateRecord> {
    let mut record = if log_file.exists() {
        debug!("updating existing upload state log {}", log_file.display());
        read_upload_state_log(log_file)?
    } else {
        StateRecord {
            run_id: run_id.to_owned(),
            run_path: run_path.to_owned(),
            completed: false,
            total_local_files: local_files.len(),
            total_uploaded_files: 0,
            total_failed_upload: 0,
            failed_upload_files: vec![],
            uploaded_files: BTreeMap::new(),
        }
    };

    record.total_local_files = local_files.len();
    record
        .uploaded_files
        .extend(uploaded_files.iter().map(|(k, v)| (k.clone(), v.clone())));
    record.failed_upload_files = failed_files.to_vec();
    record.total_uploaded_files = record.uploaded_files.len();
    record.total_failed_upload = record.failed_upload_files.len();
    record.completed = record.completed
        || (record.total_failed_upload == 0
            && record.total_uploaded_files == record.total_local_files);

    info!(
        "logging upload state of {}: total local files: {} | total uploaded \
         files: {} | total failed upload: {}",
        run_id,
        record.total_local_files,
        record.total_uploaded_files,
        record.total_failed_upload,
    );
    if record.completed {
        info!("run {} has completed uploading", run_id);
    }

    write_record_atomically(log_file, &record)?;
    Ok(record)
}

/// Serialize to a sibling temp file, then rename over the target. The rename
/// is the commit point; readers never observe a half-written log.
fn write_record_atomically(log_file: &Path, record: &StateRecord) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("could not create state log directory {}", parent.display())
        })?;
    }

    let contents = serde_json::to_string_pretty(record)
        .context("could not serialize upload state record")?;
    let temp_file = log_file.with_extension("json.tmp");
    fs::write(&temp_file, contents)
        .with_context(|| format!("could not write {}", temp_file.display()))?;
    fs::rename(&temp_file, log_file).with_context(|| {
        format!(
            "could not rename {} to {}",
            temp_file.display(),
            log_file.display()
        )
    })?;
    Ok(())
}
