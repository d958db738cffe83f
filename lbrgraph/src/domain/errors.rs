//! Structured error types for lbrgraph
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Per-line parse failures and unresolvable samples are not errors: they are
//! counted and skipped. Only IO and persisted-state problems surface here.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to open trace input {path}: {source}")]
    OpenFailed { path: PathBuf, source: std::io::Error },

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed { command: String, source: std::io::Error },

    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: std::process::ExitStatus },

    #[error("No samples could be attributed from {0} ({1} lines read)")]
    NoSamples(String, u64),

    #[error("Aggregated statistics failed validation after {0}")]
    InvalidAggregate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Unsupported save state version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Save state references missing {kind} index {index}")]
    DanglingIndex { kind: &'static str, index: usize },

    #[error("Invalid scale factor: {0}")]
    InvalidScale(f64),

    #[error("Save state {0} contains no functions")]
    Empty(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Refusing to overwrite existing file {0} (pass --overwrite)")]
    WouldOverwrite(PathBuf),

    #[error("Call graph failed validation; not exporting")]
    InvalidGraph,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_samples_display() {
        let err = IngestError::NoSamples("events.txt".to_string(), 12);
        assert_eq!(err.to_string(), "No samples could be attributed from events.txt (12 lines read)");
    }

    #[test]
    fn test_version_mismatch_display() {
        let err = StateError::VersionMismatch { found: 7, expected: 1 };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains("expected 1"));
    }

    #[test]
    fn test_overwrite_error_names_path() {
        let err = ExportError::WouldOverwrite(PathBuf::from("/tmp/graph.json"));
        assert!(err.to_string().contains("/tmp/graph.json"));
    }
}
