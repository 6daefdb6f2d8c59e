//! Helper functions for tempfile usage in tests

use anyhow::Context;
use std::path::PathBuf;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Path of a not-yet-existing log file inside `dir`, one level deep
pub fn temp_log_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("logs").join("npuforge.jsonl")
}
