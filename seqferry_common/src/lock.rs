//! The single-writer lock for monitor mode.
//!
//! An advisory exclusive `flock` on a well-known file keeps two scheduled
//! monitor invocations from uploading concurrently. If the holder crashes the
//! OS drops the lock with the process, so there is no stale-lock cleanup.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    process,
};

use fs2::FileExt;

use crate::prelude::*;

/// Name of the lock file, kept under the configured log directory.
pub const LOCK_FILE_NAME: &str = "s3_upload.lock";

/// An acquired exclusive lock. Dropping it truncates the lock file and
/// releases the lock.
#[derive(Debug)]
pub struct UploadLock {
    file: File,
    path: PathBuf,
}

impl UploadLock {
    /// Try to take the lock.
    ///
    /// Returns `Ok(None)` when another process already holds it, in which
    /// case the caller is expected to exit cleanly and let the scheduler
    /// retry. The file is opened without truncation so that a losing
    /// contender cannot wipe the holder's diagnostic line.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn acquire(path: &Path) -> Result<Option<UploadLock>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("could not open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contention(&err) => {
                debug!("lock file {} is held by another process", path.display());
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("could not lock lock file {}", path.display())
                });
            }
        }

        // Leave a note behind for anyone inspecting the lock by hand.
        let diagnostic = format!(
            "file lock acquired from running upload at {} from process {}\n",
            chrono::Local::now().format("%H:%M:%S"),
            process::id(),
        );
        file.set_len(0)
            .and_then(|_| file.write_all(diagnostic.as_bytes()))
            .with_context(|| format!("could not write to lock file {}", path.display()))?;

        debug!("acquired lock file {}", path.display());
        Ok(Some(UploadLock {
            file,
            path: path.to_owned(),
        }))
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        // Best-effort cleanup. The OS releases the lock when the descriptor
        // closes regardless of whether these calls succeed.
        let _ = self.file.set_len(0);
        let _ = fs2::FileExt::unlock(&self.file);
        debug!("released lock file {}", self.path.display());
    }
}

fn is_contention(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_diagnostic_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        let lock = UploadLock::acquire(&path).unwrap().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let pattern = regex::Regex::new(
            r"^file lock acquired from running upload at \d{2}:\d{2}:\d{2} from process \d+\n$",
        )
        .unwrap();
        assert!(pattern.is_match(&contents), "unexpected contents: {contents:?}");
        drop(lock);
    }

    #[test]
    fn second_acquire_reports_contention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        let held = UploadLock::acquire(&path).unwrap();
        assert!(held.is_some());
        assert!(UploadLock::acquire(&path).unwrap().is_none());
    }

    #[test]
    fn lock_can_be_reacquired_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        let first = UploadLock::acquire(&path).unwrap();
        drop(first);

        assert!(UploadLock::acquire(&path).unwrap().is_some());
    }

    #[test]
    fn release_truncates_the_lock_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        let lock = UploadLock::acquire(&path).unwrap();
        drop(lock);

        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn existing_contents_survive_a_losing_acquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        let _held = UploadLock::acquire(&path).unwrap().unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(UploadLock::acquire(&path).unwrap().is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}
