//! Skip-if-present check
//!
//! A local copy counts as materialized when it is a regular file (after
//! following symlinks) whose length equals the size declared by its key.
//! This is a heuristic, not a cryptographic verification: a file of the right
//! length but different content is not detected.

use std::fs;
use std::path::Path;

/// Returns true when `destination` must be (re)downloaded
pub fn needs_download(destination: &Path, expected_size: u64) -> bool {
    match fs::metadata(destination) {
        Ok(meta) => !(meta.is_file() && meta.len() == expected_size),
        Err(_) => true,
    }
}
