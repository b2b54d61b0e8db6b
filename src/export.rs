//! Sidecar export
//!
//! Builds the path → key mapping used by `--no-annex` runs from a checkout
//! that has git-annex installed.

use crate::decrypt::write_error;
use crate::error::FetchResult;
use crate::key::Sidecar;
use crate::remote::git_output;
use std::fs;
use std::path::Path;

/// Map every annexed file of `repo` to its key and write the mapping to `sidecar_path`
pub fn export_keys(repo: &Path, sidecar_path: &Path) -> FetchResult<Sidecar> {
    let listing = git_output(repo, &["annex", "find"])?;
    let sidecar = sidecar_from_listing(&listing, |path| {
        git_output(repo, &["annex", "lookupkey", path]).map(|key| key.trim().to_string())
    })?;
    tracing::info!(entries = sidecar.len(), sidecar = %sidecar_path.display(), "exporting keys");

    write_sidecar(&sidecar, sidecar_path)?;
    Ok(sidecar)
}

/// Build a sidecar from `git annex find` output, looking each path up with `lookup`
pub fn sidecar_from_listing<F>(listing: &str, mut lookup: F) -> FetchResult<Sidecar>
where
    F: FnMut(&str) -> FetchResult<String>,
{
    let mut entries = Vec::new();
    for path in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let key = lookup(path)?;
        tracing::debug!(path, %key, "looked up key");
        entries.push((path.to_string(), key));
    }
    Ok(Sidecar::from_entries(entries))
}

/// Write `sidecar` as pretty JSON
///
/// A sidecar that is itself annexed is a read-only symlink until unlocked;
/// that case is reported as [`FetchError::FilesystemPermission`](crate::FetchError::FilesystemPermission).
pub fn write_sidecar(sidecar: &Sidecar, path: &Path) -> FetchResult<()> {
    let json = sidecar.to_json()?;
    fs::write(path, json).map_err(|e| write_error(e, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;

    #[test]
    fn test_listing_maps_each_path() {
        let listing = "models/a.bin\n\nmodels/b.bin\n";
        let sidecar = sidecar_from_listing(listing, |path| {
            Ok(format!("SHA256E-s{}--00", path.len()))
        })
        .unwrap();

        assert_eq!(sidecar.len(), 2);
        assert_eq!(
            sidecar.get(Path::new("models/b.bin")),
            Some("SHA256E-s12--00")
        );
    }

    #[test]
    fn test_lookup_failure_propagates() {
        let err = sidecar_from_listing("a.bin\n", |_| Err(FetchError::Git("boom".to_string())))
            .unwrap_err();
        assert_eq!(err.kind(), "GitError");
    }

    #[test]
    fn test_written_sidecar_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large_files.json");
        let sidecar = Sidecar::from_entries([(
            "data/x.bin".to_string(),
            "SHA256E-s3--abc".to_string(),
        )]);

        write_sidecar(&sidecar, &path).unwrap();
        assert_eq!(Sidecar::load(&path).unwrap(), sidecar);
    }
}
