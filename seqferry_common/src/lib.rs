//! Code shared between the `seqferry` command-line modes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use chrono;
pub use regex;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;

pub mod config;
pub mod discovery;
pub mod fileset;
pub mod lock;
pub mod notify;
pub mod pipeline;
pub mod samplesheet;
pub mod state_log;
pub mod storage;
pub mod tracing_support;
pub mod uploader;

/// Common imports used by many modules.
pub mod prelude {
    pub use std::{
        collections::{BTreeMap, BTreeSet, HashMap},
        fmt,
        path::{Path, PathBuf},
        sync::Arc,
    };

    pub use anyhow::{format_err, Context};
    pub use serde::{Deserialize, Serialize};
    pub use tracing::{
        debug, debug_span, error, error_span, info, info_span, instrument, trace,
        trace_span, warn, warn_span,
    };

    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;
/// Result type for this crate's functions.
pub use anyhow::Result;

/// Format a byte count as a short human-readable string, e.g. `1.24GB`.
///
/// Used when summarising how much data a run upload will move.
pub fn human_bytes(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB"] {
        if size < 1024.0 {
            return format!("{:.2}{}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2}YB", size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_sensible_units() {
        assert_eq!(human_bytes(0), "0.00B");
        assert_eq!(human_bytes(1), "1.00B");
        assert_eq!(human_bytes(1024), "1.00KB");
        assert_eq!(human_bytes(1_363_149), "1.30MB");
        assert_eq!(human_bytes(4 * 1024 * 1024 * 1024), "4.00GB");
    }
}
