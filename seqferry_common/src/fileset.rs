//! Enumerating a run's files and splitting them into balanced shards.

use regex::Regex;
use walkdir::WalkDir;

use crate::prelude::*;

/// A local file queued for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFileEntry {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Size in bytes, from `stat`.
    pub size: u64,
}

/// Recursively list the files of a run directory, largest first.
///
/// Only regular files are returned; empty directories and special files are
/// ignored, and symlinks are not followed. Sorting by size lets the
/// partitioner interleave large and small files across shards, balancing
/// both byte throughput and file count per shard.
///
/// `exclude_patterns` are joined into a single alternation; any file whose
/// full path matches it is dropped.
#[instrument(skip_all, fields(seq_dir = %seq_dir.display()))]
pub fn get_sequencing_file_list(
    seq_dir: &Path,
    exclude_patterns: &[String],
) -> Result<Vec<PathBuf>> {
    let exclude = build_exclude_filter(exclude_patterns)?;

    let mut files = vec![];
    let mut total_size = 0u64;
    for entry in WalkDir::new(seq_dir).follow_links(false) {
        let entry = entry
            .with_context(|| format!("error walking directory {}", seq_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        if let Some(exclude) = &exclude {
            if exclude.is_match(&path.to_string_lossy()) {
                trace!("excluding {} from upload", path.display());
                continue;
            }
        }
        let size = entry
            .metadata()
            .with_context(|| format!("could not stat {}", path.display()))?
            .len();
        total_size += size;
        files.push(LocalFileEntry { path, size });
    }

    files.sort_by(|a, b| b.size.cmp(&a.size));
    debug!(
        "found {} files ({}) in {}",
        files.len(),
        crate::human_bytes(total_size),
        seq_dir.display(),
    );

    Ok(files.into_iter().map(|entry| entry.path).collect())
}

/// Compile the exclude patterns into one alternation, if any were given.
fn build_exclude_filter(exclude_patterns: &[String]) -> Result<Option<Regex>> {
    if exclude_patterns.is_empty() {
        return Ok(None);
    }
    let alternation = exclude_patterns.join("|");
    Ok(Some(Regex::new(&alternation).with_context(|| {
        format!("could not compile exclude patterns {:?}", exclude_patterns)
    })?))
}

/// Split a size-sorted file list into at most `n` balanced shards.
///
/// Round-robin over the size-ordered input: shard `i` receives the `i`-th
/// largest file, the `(n+i)`-th largest, and so on, so shards end up with
/// near-equal file counts and byte totals. With fewer files than shards the
/// result has one singleton shard per file; never an empty shard.
pub fn split_file_list_by_cores<T: Clone>(files: &[T], n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    (0..n)
        .map(|offset| {
            files
                .iter()
                .skip(offset)
                .step_by(n)
                .cloned()
                .collect::<Vec<_>>()
        })
        .filter(|shard| !shard.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::{tempdir, TempDir};

    /// Lay out an approximation of a sequencing run with files of differing
    /// sizes (sparse, so nothing is actually written to disk).
    fn sequencing_run_fixture() -> (TempDir, Vec<(&'static str, u64)>) {
        let files = vec![
            ("Data/Intensities/BaseCalls/L001/C1.1/L001_2.cbcl", 232_012_345),
            ("Data/Intensities/BaseCalls/L002/C1.1/L002_2.cbcl", 232_016_170),
            ("Thumbnail_Images/L001/C1.1/s_1_2103_green.png", 69_551),
            ("Thumbnail_Images/L002/C1.1/s_1_2103_red.png", 54_132),
            ("InterOp/C1.1/BasecallingMetricsOut.bin", 13_731),
            ("Logs/240927_A01295_0425_AHJWGFDRX5_Cycle0_Log.00.log", 5_243_517),
        ];

        let dir = tempdir().unwrap();
        for (name, size) in &files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            File::create(&path).unwrap().set_len(*size).unwrap();
        }
        (dir, files)
    }

    fn relative(paths: &[PathBuf], root: &Path) -> Vec<String> {
        paths
            .iter()
            .map(|path| {
                path.strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn files_come_back_sorted_by_size_descending() {
        let (dir, _) = sequencing_run_fixture();

        let files = get_sequencing_file_list(dir.path(), &[]).unwrap();

        assert_eq!(
            relative(&files, dir.path()),
            [
                "Data/Intensities/BaseCalls/L002/C1.1/L002_2.cbcl",
                "Data/Intensities/BaseCalls/L001/C1.1/L001_2.cbcl",
                "Logs/240927_A01295_0425_AHJWGFDRX5_Cycle0_Log.00.log",
                "Thumbnail_Images/L001/C1.1/s_1_2103_green.png",
                "Thumbnail_Images/L002/C1.1/s_1_2103_red.png",
                "InterOp/C1.1/BasecallingMetricsOut.bin",
            ]
        );
    }

    #[test]
    fn empty_directories_are_ignored() {
        let (dir, files) = sequencing_run_fixture();
        fs::create_dir_all(dir.path().join("empty_dir")).unwrap();

        let returned = get_sequencing_file_list(dir.path(), &[]).unwrap();

        let mut expected = files
            .iter()
            .map(|(name, _)| name.to_string())
            .collect::<Vec<_>>();
        expected.sort();
        let mut returned = relative(&returned, dir.path());
        returned.sort();
        assert_eq!(returned, expected);
    }

    #[test]
    fn exclude_patterns_remove_matching_files() {
        let (dir, _) = sequencing_run_fixture();

        let cases: &[(&[&str], &[&str])] = &[
            (
                &[".*png$"],
                &[
                    "Data/Intensities/BaseCalls/L001/C1.1/L001_2.cbcl",
                    "Data/Intensities/BaseCalls/L002/C1.1/L002_2.cbcl",
                    "InterOp/C1.1/BasecallingMetricsOut.bin",
                    "Logs/240927_A01295_0425_AHJWGFDRX5_Cycle0_Log.00.log",
                ],
            ),
            (
                &[".*png$", ".*log$"],
                &[
                    "Data/Intensities/BaseCalls/L001/C1.1/L001_2.cbcl",
                    "Data/Intensities/BaseCalls/L002/C1.1/L002_2.cbcl",
                    "InterOp/C1.1/BasecallingMetricsOut.bin",
                ],
            ),
            (
                &["Thumbnail_Images/"],
                &[
                    "Data/Intensities/BaseCalls/L001/C1.1/L001_2.cbcl",
                    "Data/Intensities/BaseCalls/L002/C1.1/L002_2.cbcl",
                    "InterOp/C1.1/BasecallingMetricsOut.bin",
                    "Logs/240927_A01295_0425_AHJWGFDRX5_Cycle0_Log.00.log",
                ],
            ),
        ];

        for (patterns, expected) in cases {
            let patterns = patterns
                .iter()
                .map(|p| (*p).to_owned())
                .collect::<Vec<_>>();
            let returned = get_sequencing_file_list(dir.path(), &patterns).unwrap();
            let mut returned = relative(&returned, dir.path());
            returned.sort();
            assert_eq!(&returned, expected, "patterns: {patterns:?}");
        }
    }

    #[test]
    fn excluding_everything_returns_no_files() {
        let (dir, _) = sequencing_run_fixture();
        let everything = vec![".*".to_owned()];

        let returned = get_sequencing_file_list(dir.path(), &everything).unwrap();
        assert!(returned.is_empty());
    }

    const ITEMS: [u32; 16] = [
        1, 2, 3, 4, 5, 6, 7, 8, 100, 110, 120, 130, 140, 150, 160, 170,
    ];

    #[test]
    fn list_splits_round_robin() {
        let shards = split_file_list_by_cores(&ITEMS, 4);

        assert_eq!(
            shards,
            [
                [1, 5, 100, 140],
                [2, 6, 110, 150],
                [3, 7, 120, 160],
                [4, 8, 130, 170],
            ]
        );
    }

    #[test]
    fn uneven_splits_differ_by_at_most_one() {
        let shards = split_file_list_by_cores(&ITEMS, 3);

        assert_eq!(
            shards,
            [
                vec![1, 4, 7, 110, 140, 170],
                vec![2, 5, 8, 120, 150],
                vec![3, 6, 100, 130, 160],
            ]
        );
    }

    #[test]
    fn more_shards_than_files_yields_singletons() {
        assert_eq!(split_file_list_by_cores(&[1, 2], 3), [[1], [2]]);
    }

    #[test]
    fn empty_input_yields_no_shards() {
        assert_eq!(split_file_list_by_cores::<u32>(&[], 2), Vec::<Vec<u32>>::new());
    }

    #[test]
    fn splitting_preserves_the_multiset() {
        for n in 1..=20 {
            let shards = split_file_list_by_cores(&ITEMS, n);

            let mut recovered = shards.iter().flatten().copied().collect::<Vec<_>>();
            recovered.sort_unstable();
            let mut original = ITEMS.to_vec();
            original.sort_unstable();
            assert_eq!(recovered, original, "n = {n}");

            let longest = shards.iter().map(Vec::len).max().unwrap_or(0);
            let shortest = shards.iter().map(Vec::len).min().unwrap_or(0);
            assert!(longest - shortest <= 1, "n = {n}");
            assert!(longest <= ITEMS.len().div_ceil(n), "n = {n}");
        }
    }
}
