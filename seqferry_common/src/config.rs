//! The monitor-mode config file.
//!
//! The config is JSON, loaded once at startup. Validation runs against the
//! raw JSON value before deserializing, so that every problem is reported in
//! a single aggregated error rather than one `serde` failure at a time.

use std::fs;

use regex::Regex;
use serde_json::Value;

use crate::prelude::*;

/// Parsed contents of the monitor config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Maximum shard count to split a run's files across. Defaults to the
    /// host's available parallelism.
    #[serde(default)]
    pub max_cores: Option<usize>,
    /// Maximum in-flight uploads per shard.
    #[serde(default)]
    pub max_threads: Option<usize>,
    /// Directory holding the rotating log, the per-run upload state logs and
    /// the lock file.
    pub log_dir: PathBuf,
    /// Webhook to post upload success summaries to.
    #[serde(default)]
    pub slack_log_webhook: Option<String>,
    /// Webhook to post upload failure summaries to.
    #[serde(default)]
    pub slack_alert_webhook: Option<String>,
    /// The directories to monitor, and where each uploads to.
    pub monitor: Vec<MonitorEntry>,
}

/// One monitored set of sequencer output directories and its destination.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MonitorEntry {
    /// Directories whose immediate subdirectories are candidate runs.
    pub monitored_directories: Vec<PathBuf>,
    /// Destination bucket.
    pub bucket: String,
    /// Key prefix inside the bucket to upload runs under.
    pub remote_path: String,
    /// If set, only runs where every samplesheet sample name matches this
    /// regex are uploaded.
    #[serde(default)]
    pub sample_regex: Option<String>,
    /// Regexes for local file paths to leave out of the upload.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Config {
    /// Shard count to use for uploads.
    pub fn cores(&self) -> usize {
        self.max_cores.unwrap_or_else(default_cores)
    }

    /// Per-shard in-flight upload limit.
    pub fn threads(&self) -> usize {
        self.max_threads.unwrap_or(4)
    }

    /// The webhook for success messages, if one is configured. An empty
    /// string in the config counts as not configured.
    pub fn log_webhook(&self) -> Option<&str> {
        self.slack_log_webhook
            .as_deref()
            .filter(|url| !url.is_empty())
    }

    /// The webhook for failure messages, if one is configured.
    pub fn alert_webhook(&self) -> Option<&str> {
        self.slack_alert_webhook
            .as_deref()
            .filter(|url| !url.is_empty())
    }

    /// Every bucket named by a monitor entry, deduplicated.
    pub fn buckets(&self) -> BTreeSet<String> {
        self.monitor.iter().map(|m| m.bucket.clone()).collect()
    }
}

impl MonitorEntry {
    /// Compile the sample-name filter, if one is configured.
    pub fn sample_filter(&self) -> Result<Option<Regex>> {
        self.sample_regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| {
                    format!("could not compile sample_regex {:?}", pattern)
                })
            })
            .transpose()
    }
}

/// The default for `max_cores`: the host's available parallelism.
pub fn default_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Read and validate the config file.
#[instrument(skip_all, fields(config = %path.display()))]
pub fn read_config(path: &Path) -> Result<Config> {
    info!("loading config from {}", path.display());
    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read config file {}", path.display()))?;
    let raw = serde_json::from_str::<Value>(&contents)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    verify_config(&raw)?;
    serde_json::from_value(raw)
        .with_context(|| format!("could not parse config file {}", path.display()))
}

/// Check the raw config value, aggregating every problem found into a single
/// error listing all of them.
pub fn verify_config(raw: &Value) -> Result<()> {
    let mut errors = vec![];

    for field in ["max_cores", "max_threads"] {
        if let Some(value) = raw.get(field) {
            if !value.is_u64() {
                errors.push(format!("{} must be an integer", field));
            }
        }
    }

    match raw.get("log_dir") {
        None | Some(Value::Null) => {
            errors.push("required parameter log_dir not defined".to_owned());
        }
        Some(value) if !value.is_string() => {
            errors.push(type_error("log_dir", "string", value));
        }
        Some(_) => {}
    }

    for field in ["slack_log_webhook", "slack_alert_webhook"] {
        if let Some(value) = raw.get(field) {
            if !value.is_null() && !value.is_string() {
                errors.push(type_error(field, "string", value));
            }
        }
    }

    match raw.get("monitor") {
        None | Some(Value::Null) => {
            errors.push("required parameter monitor not defined".to_owned());
        }
        Some(Value::Array(entries)) if entries.is_empty() => {
            errors.push("monitor must contain at least one entry".to_owned());
        }
        Some(Value::Array(entries)) => {
            for (section, entry) in entries.iter().enumerate() {
                verify_monitor_entry(section, entry, &mut errors);
            }
        }
        Some(value) => {
            errors.push(type_error("monitor", "array", value));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let listing = errors
            .iter()
            .enumerate()
            .map(|(n, error)| format!("\n\t{}. {}", n + 1, error))
            .collect::<String>();
        Err(format_err!(
            "{} errors found in config:{}",
            errors.len(),
            listing
        ))
    }
}

/// Check one entry of the `monitor` array.
fn verify_monitor_entry(section: usize, entry: &Value, errors: &mut Vec<String>) {
    match entry.get("monitored_directories") {
        None | Some(Value::Null) => errors.push(format!(
            "required parameter monitored_directories missing from monitor section {}",
            section
        )),
        Some(value @ Value::Array(_)) => {
            let dirs = value.as_array().expect("checked above");
            if dirs.is_empty() {
                errors.push(format!(
                    "monitored_directories empty in monitor section {}",
                    section
                ));
            } else if dirs.iter().any(|dir| !dir.is_string()) {
                errors.push(section_type_error(
                    "monitored_directories",
                    section,
                    "array of strings",
                    value,
                ));
            }
        }
        Some(value) => errors.push(section_type_error(
            "monitored_directories",
            section,
            "array of strings",
            value,
        )),
    }

    for field in ["bucket", "remote_path"] {
        match entry.get(field) {
            None | Some(Value::Null) => errors.push(format!(
                "required parameter {} missing from monitor section {}",
                field, section
            )),
            Some(value) if !value.is_string() => {
                errors.push(section_type_error(field, section, "string", value));
            }
            Some(_) => {}
        }
    }

    if let Some(value) = entry.get("sample_regex") {
        match value.as_str() {
            Some(pattern) => {
                if let Err(err) = Regex::new(pattern) {
                    errors.push(format!(
                        "sample_regex in monitor section {} is not a valid regex: {}",
                        section, err
                    ));
                }
            }
            None if value.is_null() => {}
            None => errors.push(section_type_error("sample_regex", section, "string", value)),
        }
    }

    if let Some(value) = entry.get("exclude_patterns") {
        match value.as_array() {
            Some(patterns) => {
                for pattern in patterns {
                    match pattern.as_str() {
                        Some(pattern) => {
                            if let Err(err) = Regex::new(pattern) {
                                errors.push(format!(
                                    "exclude pattern in monitor section {} is not a valid regex: {}",
                                    section, err
                                ));
                            }
                        }
                        None => errors.push(section_type_error(
                            "exclude_patterns",
                            section,
                            "array of strings",
                            value,
                        )),
                    }
                }
            }
            None if value.is_null() => {}
            None => errors.push(section_type_error(
                "exclude_patterns",
                section,
                "array of strings",
                value,
            )),
        }
    }
}

fn type_error(field: &str, expected: &str, found: &Value) -> String {
    format!(
        "{} not of expected type. Expected: {} | Found: {}",
        field,
        expected,
        json_type_name(found)
    )
}

fn section_type_error(field: &str, section: usize, expected: &str, found: &Value) -> String {
    format!(
        "{} not of expected type from monitor section {}. Expected: {} | Found: {}",
        field,
        section,
        expected,
        json_type_name(found)
    )
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_config() -> Value {
        json!({
            "max_cores": 4,
            "max_threads": 8,
            "log_dir": "/var/log/seqferry",
            "monitor": [
                {
                    "monitored_directories": [
                        "/absolute/path/to/sequencer_1",
                        "/absolute/path/to/sequencer_2",
                    ],
                    "bucket": "bucket_A",
                    "remote_path": "/",
                },
                {
                    "monitored_directories": ["/absolute/path/to/sequencer_3"],
                    "bucket": "bucket_B",
                    "remote_path": "/sequencer_3_runs",
                    "sample_regex": "assay_[12]",
                },
            ],
        })
    }

    #[test]
    fn valid_config_passes_and_deserializes() {
        let raw = valid_config();
        verify_config(&raw).unwrap();

        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.cores(), 4);
        assert_eq!(config.threads(), 8);
        assert_eq!(config.monitor.len(), 2);
        assert_eq!(
            config.buckets(),
            BTreeSet::from(["bucket_A".to_owned(), "bucket_B".to_owned()])
        );
        assert!(config.monitor[1].sample_filter().unwrap().is_some());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut raw = valid_config();
        raw["log_level"] = json!("INFO");
        verify_config(&raw).unwrap();
        serde_json::from_value::<Config>(raw).unwrap();
    }

    #[test]
    fn invalid_config_aggregates_all_errors() {
        let raw = json!({
            "max_cores": "4",
            "max_threads": "8",
            "monitor": [
                { "bucket": "bucket_A" },
                {
                    "monitored_directories": ["/absolute/path/to/sequencer_3"],
                    "bucket": 1,
                    "remote_path": "/sequencer_3_runs",
                },
            ],
        });

        let message = verify_config(&raw).unwrap_err().to_string();
        assert!(message.starts_with("6 errors found in config:"), "{message}");
        assert!(message.contains("max_cores must be an integer"));
        assert!(message.contains("max_threads must be an integer"));
        assert!(message.contains("required parameter log_dir not defined"));
        assert!(message.contains(
            "required parameter monitored_directories missing from monitor section 0"
        ));
        assert!(message
            .contains("required parameter remote_path missing from monitor section 0"));
        assert!(message.contains(
            "bucket not of expected type from monitor section 1. \
             Expected: string | Found: number"
        ));
    }

    #[test]
    fn missing_monitor_section_is_an_error() {
        let raw = json!({
            "max_cores": 4,
            "max_threads": 8,
            "log_dir": "/var/log/seqferry",
        });

        let message = verify_config(&raw).unwrap_err().to_string();
        assert_eq!(
            message,
            "1 errors found in config:\n\t1. required parameter monitor not defined"
        );
    }

    #[test]
    fn bad_sample_regex_is_an_error() {
        let mut raw = valid_config();
        raw["monitor"][0]["sample_regex"] = json!("assay_[");
        let message = verify_config(&raw).unwrap_err().to_string();
        assert!(message.contains("sample_regex in monitor section 0 is not a valid regex"));
    }

    #[test]
    fn empty_webhook_strings_count_as_unset() {
        let mut raw = valid_config();
        raw["slack_log_webhook"] = json!("");
        raw["slack_alert_webhook"] = json!("https://hooks.example.com/services/T000/B000");
        verify_config(&raw).unwrap();

        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.log_webhook(), None);
        assert_eq!(
            config.alert_webhook(),
            Some("https://hooks.example.com/services/T000/B000")
        );
    }
}
