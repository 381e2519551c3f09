//! Locating and parsing a run's samplesheet.
//!
//! Sequencers (and operators) are not consistent about samplesheet naming,
//! so we match anything that looks like one. When several candidates exist
//! they must agree exactly, otherwise we cannot tell which one is real and
//! the run is skipped.

use std::fs;

use lazy_static::lazy_static;
use regex::Regex;

use crate::prelude::*;

lazy_static! {
    static ref SAMPLESHEET_FILE_RE: Regex =
        Regex::new(r"(?i)^.*sample[-_ ]?sheet.*\.csv$").expect("couldn't parse built-in regex");
}

/// Read the samplesheet from a run directory.
///
/// Returns the samplesheet contents as lines, with trailing newlines
/// stripped. Returns `None` when no candidate file matches, or when several
/// candidates disagree.
#[instrument(skip_all, fields(run_dir = %run_dir.display()))]
pub fn read_samplesheet_from_run_directory(run_dir: &Path) -> Result<Option<Vec<String>>> {
    let mut candidates = vec![];
    let entries = fs::read_dir(run_dir)
        .with_context(|| format!("could not list run directory {}", run_dir.display()))?;
    for entry in entries {
        let entry = entry
            .with_context(|| format!("could not list run directory {}", run_dir.display()))?;
        let name = entry.file_name();
        if SAMPLESHEET_FILE_RE.is_match(&name.to_string_lossy()) {
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    if candidates.is_empty() {
        debug!("no samplesheet found in {}", run_dir.display());
        return Ok(None);
    }

    let mut contents: Option<Vec<String>> = None;
    for candidate in &candidates {
        let text = fs::read_to_string(candidate)
            .with_context(|| format!("could not read samplesheet {}", candidate.display()))?;
        let lines = text
            .trim_end_matches('\n')
            .split('\n')
            .map(|line| line.to_owned())
            .collect::<Vec<_>>();

        match &contents {
            None => contents = Some(lines),
            Some(previous) if *previous == lines => {}
            Some(_) => {
                warn!(
                    "multiple samplesheets with differing contents found in {}: {:?}",
                    run_dir.display(),
                    candidates
                );
                return Ok(None);
            }
        }
    }

    Ok(contents)
}

/// Pull the sample names out of samplesheet contents.
///
/// Names are the first comma-separated field of every line following the
/// `Sample_ID` header. Returns `None` if that header is missing or appears
/// more than once.
pub fn sample_names_from_samplesheet(contents: &[String]) -> Option<Vec<String>> {
    let header_lines = contents
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("Sample_ID"))
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    let header = match header_lines.as_slice() {
        [index] => *index,
        [] => {
            warn!("no Sample_ID header line found in samplesheet");
            return None;
        }
        _ => {
            warn!("more than one Sample_ID header line found in samplesheet");
            return None;
        }
    };

    Some(
        contents[header + 1..]
            .iter()
            .map(|line| {
                line.split(',')
                    .next()
                    .unwrap_or_default()
                    .to_owned()
            })
            .collect(),
    )
}

/// Decide whether every sample in the samplesheet is uploadable.
///
/// Returns `Some(true)` when every sample name matches `sample_regex`
/// (unanchored search), `Some(false)` on the first miss and `None` when no
/// sample names could be extracted at all.
pub fn check_all_uploadable_samples(
    contents: &[String],
    sample_regex: &Regex,
) -> Option<bool> {
    let names = sample_names_from_samplesheet(contents)?;
    if names.is_empty() {
        warn!("samplesheet contains a Sample_ID header but no sample lines");
        return None;
    }
    Some(names.iter().all(|name| sample_regex.is_match(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn samplesheet_name_variants_are_found() {
        let names = [
            "SAMPLESHEET.CSV",
            "SampleSheet.csv",
            "Samplesheet.csv",
            "samplesheet.csv",
            "experiment_1_samplesheet.csv",
            "experiment_2_SampleSheet.csv",
            "experiment_3-samplesheet_attempt_1.csv",
            "sample sheet.csv",
        ];

        for name in names {
            let dir = tempdir().unwrap();
            write(dir.path(), name, "foo\nbar");

            let contents = read_samplesheet_from_run_directory(dir.path()).unwrap();
            assert_eq!(
                contents,
                Some(vec!["foo".to_owned(), "bar".to_owned()]),
                "failed for {name}"
            );
        }
    }

    #[test]
    fn non_samplesheets_are_not_selected() {
        let names = [
            "my_file.csv",
            "SampleSheet.txt",
            "samplesheet.tsv",
            "Samplesheet.xlsx",
            "samplesheet",
            "sample_1.csv",
        ];

        for name in names {
            let dir = tempdir().unwrap();
            write(dir.path(), name, "foo\nbar");

            let contents = read_samplesheet_from_run_directory(dir.path()).unwrap();
            assert_eq!(contents, None, "wrongly matched {name}");
        }
    }

    #[test]
    fn trailing_newlines_are_stripped() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "samplesheet.csv",
            "Sample_ID\nsample_a\nsample_b\nsample_n\n\n",
        );

        let contents = read_samplesheet_from_run_directory(dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(contents, ["Sample_ID", "sample_a", "sample_b", "sample_n"]);
    }

    #[test]
    fn agreeing_duplicates_return_contents() {
        let dir = tempdir().unwrap();
        write(dir.path(), "samplesheet1.csv", "foo\nbar");
        write(dir.path(), "samplesheet2.csv", "foo\nbar");

        let contents = read_samplesheet_from_run_directory(dir.path()).unwrap();
        assert_eq!(contents, Some(vec!["foo".to_owned(), "bar".to_owned()]));
    }

    #[test]
    fn disagreeing_duplicates_return_none() {
        let dir = tempdir().unwrap();
        write(dir.path(), "samplesheet1.csv", "foo\nbar");
        write(dir.path(), "samplesheet2.csv", "baz\nblarg");

        let contents = read_samplesheet_from_run_directory(dir.path()).unwrap();
        assert_eq!(contents, None);
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| (*line).to_owned()).collect()
    }

    #[test]
    fn sample_names_follow_the_header_line() {
        let contents = lines(&[
            "[Header]",
            "Investigator Name,jethro",
            "[Data]",
            "Sample_ID,Sample_Name,Index",
            "sample_1-assay_1,sample_1,ATTCCG",
            "sample_2-assay_1,sample_2,GGCATG",
        ]);

        assert_eq!(
            sample_names_from_samplesheet(&contents),
            Some(vec![
                "sample_1-assay_1".to_owned(),
                "sample_2-assay_1".to_owned(),
            ])
        );
    }

    #[test]
    fn missing_or_duplicate_header_returns_none() {
        let no_header = lines(&["[Data]", "sample_1,foo"]);
        assert_eq!(sample_names_from_samplesheet(&no_header), None);

        let two_headers = lines(&[
            "Sample_ID,Sample_Name",
            "sample_1,foo",
            "Sample_ID,Sample_Name",
            "sample_2,bar",
        ]);
        assert_eq!(sample_names_from_samplesheet(&two_headers), None);
    }

    #[test]
    fn uploadable_requires_every_name_to_match() {
        let contents = lines(&[
            "Sample_ID,Sample_Name",
            "sample_1-assay_1,foo",
            "sample_2-assay_1,bar",
        ]);
        let assay_1 = Regex::new("assay_1").unwrap();
        let assay_2 = Regex::new("assay_2").unwrap();

        assert_eq!(check_all_uploadable_samples(&contents, &assay_1), Some(true));
        assert_eq!(check_all_uploadable_samples(&contents, &assay_2), Some(false));

        let mixed = lines(&[
            "Sample_ID,Sample_Name",
            "sample_1-assay_1,foo",
            "sample_2-assay_2,bar",
        ]);
        assert_eq!(check_all_uploadable_samples(&mixed, &assay_1), Some(false));
    }

    #[test]
    fn no_extractable_names_returns_none() {
        let header_only = lines(&["Sample_ID,Sample_Name"]);
        let regex = Regex::new("assay_1").unwrap();
        assert_eq!(check_all_uploadable_samples(&header_only, &regex), None);

        let no_header = lines(&["sample_1,foo"]);
        assert_eq!(check_all_uploadable_samples(&no_header, &regex), None);
    }
}
