//! Finding and classifying candidate runs under the monitored directories.
//!
//! Classification is pure: it reads the filesystem and the upload state logs
//! but never writes. Checks run cheapest first, so most directories are
//! dismissed on a couple of `stat` calls and the samplesheet is only parsed
//! once a run is known to be complete.

use std::fs;

use regex::Regex;

use crate::{
    prelude::*,
    samplesheet::{check_all_uploadable_samples, read_samplesheet_from_run_directory},
    state_log::{classify_from_log, state_log_path, UploadState},
};

/// Names marking a directory as a sequencing run.
const RUN_MARKER_FILE: &str = "RunInfo.xml";

/// Any of these marks a run as having finished sequencing: `CopyComplete.txt`
/// for NovaSeqs, `RTAComplete.txt`/`.xml` for other Illumina sequencers.
const TERMINATION_FILES: [&str; 3] =
    ["CopyComplete.txt", "RTAComplete.txt", "RTAComplete.xml"];

/// What discovery decided about one directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunClassification {
    /// Not a sequencing run at all.
    NotRun,
    /// A run that has not finished sequencing yet; check again next sweep.
    Incomplete,
    /// A complete run whose samples do not all match the sample filter.
    Filtered,
    /// A complete run with no recorded upload state.
    New,
    /// A run with some files already uploaded on a previous invocation.
    Partial(BTreeSet<PathBuf>),
    /// A run that finished uploading; nothing to do, ever.
    Uploaded,
}

/// The runs one sweep of a monitor entry's directories found to need work.
#[derive(Debug, Default)]
pub struct DiscoveredRuns {
    /// Runs with no upload state at all.
    pub new_runs: Vec<PathBuf>,
    /// Partially uploaded runs, with the already-uploaded local paths.
    pub partial_runs: Vec<(PathBuf, BTreeSet<PathBuf>)>,
}

/// Check whether a directory is a sequencing run.
pub fn check_is_sequencing_run_dir(run_dir: &Path) -> bool {
    run_dir.join(RUN_MARKER_FILE).exists()
}

/// Check whether a run has finished sequencing.
pub fn check_termination_file_exists(run_dir: &Path) -> bool {
    TERMINATION_FILES
        .iter()
        .any(|name| run_dir.join(name).exists())
}

/// Classify one candidate directory.
///
/// Fails when the samplesheet cannot be read unambiguously or yields no
/// sample names; the caller logs this and skips the run, leaving it to be
/// looked at again on the next sweep.
pub fn classify_run_dir(
    run_dir: &Path,
    log_dir: &Path,
    sample_regex: Option<&Regex>,
) -> Result<RunClassification> {
    if !check_is_sequencing_run_dir(run_dir) {
        return Ok(RunClassification::NotRun);
    }
    if !check_termination_file_exists(run_dir) {
        return Ok(RunClassification::Incomplete);
    }

    let contents = read_samplesheet_from_run_directory(run_dir)?.ok_or_else(|| {
        format_err!(
            "could not read a single unambiguous samplesheet from {}",
            run_dir.display()
        )
    })?;

    if let Some(sample_regex) = sample_regex {
        match check_all_uploadable_samples(&contents, sample_regex) {
            Some(true) => {}
            Some(false) => return Ok(RunClassification::Filtered),
            None => {
                return Err(format_err!(
                    "could not extract sample names from samplesheet in {}",
                    run_dir.display()
                ));
            }
        }
    }

    let run_id = run_id_of(run_dir)?;
    match classify_from_log(&state_log_path(log_dir, &run_id)) {
        UploadState::Uploaded => Ok(RunClassification::Uploaded),
        UploadState::Partial(uploaded) => Ok(RunClassification::Partial(uploaded)),
        UploadState::New => Ok(RunClassification::New),
    }
}

/// Sweep the monitored directories for runs needing upload.
///
/// A classification error for one directory (unreadable samplesheet and the
/// like) is logged and skips just that directory.
#[instrument(skip_all, fields(directories = monitored_directories.len()))]
pub fn get_runs_to_upload(
    monitored_directories: &[PathBuf],
    log_dir: &Path,
    sample_regex: Option<&Regex>,
) -> DiscoveredRuns {
    let mut discovered = DiscoveredRuns::default();

    for monitored_dir in monitored_directories {
        debug!("checking {} for completed runs", monitored_dir.display());
        let entries = match fs::read_dir(monitored_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!(
                    "could not list monitored directory {}: {}",
                    monitored_dir.display(),
                    err
                );
                continue;
            }
        };

        for entry in entries {
            let run_dir = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    error!(
                        "could not list monitored directory {}: {}",
                        monitored_dir.display(),
                        err
                    );
                    continue;
                }
            };
            if !run_dir.is_dir() {
                continue;
            }

            match classify_run_dir(&run_dir, log_dir, sample_regex) {
                Ok(RunClassification::New) => {
                    info!("found new run to upload: {}", run_dir.display());
                    discovered.new_runs.push(run_dir);
                }
                Ok(RunClassification::Partial(uploaded)) => {
                    info!(
                        "found partially uploaded run to continue: {}",
                        run_dir.display()
                    );
                    discovered.partial_runs.push((run_dir, uploaded));
                }
                Ok(RunClassification::Uploaded) => {
                    debug!("{} has already fully uploaded", run_dir.display());
                }
                Ok(RunClassification::NotRun) => {
                    debug!("{} is not a sequencing run", run_dir.display());
                }
                Ok(RunClassification::Incomplete) => {
                    debug!("{} has not finished sequencing", run_dir.display());
                }
                Ok(RunClassification::Filtered) => {
                    info!(
                        "samples in {} do not all match the configured sample \
                         regex, not uploading",
                        run_dir.display()
                    );
                }
                Err(err) => {
                    error!("skipping {}: {:?}", run_dir.display(), err);
                }
            }
        }
    }

    discovered.new_runs.sort();
    discovered.partial_runs.sort();
    discovered
}

/// Derive the run ID from a run directory path (its last component).
pub fn run_id_of(run_dir: &Path) -> Result<String> {
    Ok(run_dir
        .file_name()
        .ok_or_else(|| format_err!("run path {} has no final component", run_dir.display()))?
        .to_string_lossy()
        .into_owned())
}
