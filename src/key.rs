//! Annex key parsing and working-tree path resolution
//!
//! A git-annex key has the shape `BACKEND-s<SIZE>[-<field>...]--<NAME>`, for
//! example `SHA256E-s1024--81a9ef...c3.bin`. In an annexed working tree each
//! file is a symlink whose target's file name is the key. Without git-annex,
//! the same mapping is read from a JSON sidecar produced by `gadown
//! export-keys`.

use crate::error::{FetchError, FetchResult};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Default file name of the sidecar mapping
pub const DEFAULT_SIDECAR: &str = "large_files.json";

/// Canonical identifier of annexed content
///
/// Construction validates the size field, so [`ContentKey::size`] is
/// infallible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    raw: String,
    backend_end: usize,
    size: u64,
}

impl ContentKey {
    /// Parse a key, extracting its declared byte size
    pub fn parse(raw: &str) -> FetchResult<Self> {
        let malformed = |reason: &str| FetchError::MalformedKey {
            key: raw.to_string(),
            reason: reason.to_string(),
        };

        let (fields, name) = raw
            .split_once("--")
            .ok_or_else(|| malformed("missing '--' separator"))?;
        if name.is_empty() {
            return Err(malformed("empty digest"));
        }

        let mut parts = fields.split('-');
        let backend = parts.next().unwrap_or_default();
        if backend.is_empty() {
            return Err(malformed("missing backend name"));
        }

        let size_field = parts
            .find(|field| field.starts_with('s'))
            .ok_or_else(|| malformed("missing size field"))?;
        let digits = &size_field[1..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("size field is not an unsigned integer"));
        }
        let size = digits
            .parse::<u64>()
            .map_err(|_| malformed("size field does not fit in 64 bits"))?;

        Ok(Self {
            raw: raw.to_string(),
            backend_end: backend.len(),
            size,
        })
    }

    /// Declared content size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Key backend, e.g. `SHA256E`
    pub fn backend(&self) -> &str {
        &self.raw[..self.backend_end]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// How working-tree paths are mapped to keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Paths are annex symlinks (the default)
    #[default]
    Symlink,
    /// Paths are looked up in the sidecar mapping (`--no-annex`)
    Sidecar,
}

/// A path resolved to its key and the location its content belongs at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub key: ContentKey,
    pub destination: PathBuf,
}

/// Path → key mapping persisted as JSON
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sidecar {
    entries: BTreeMap<String, String>,
}

impl Sidecar {
    pub fn from_json(json: &str) -> FetchResult<Self> {
        let entries: BTreeMap<String, String> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries))
    }

    pub fn load(path: impl AsRef<Path>) -> FetchResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            FetchError::Config(format!("cannot read sidecar '{}': {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(path, key)| (path_key(Path::new(&path)), key))
                .collect(),
        }
    }

    pub fn to_json(&self) -> FetchResult<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.entries
            .get(path_key(path).as_str())
            .map(String::as_str)
    }

    /// Sidecar paths at or below `prefix`, compared component by component
    pub fn paths_under<'a>(&'a self, prefix: &'a Path) -> impl Iterator<Item = PathBuf> + 'a {
        let prefix = normalize(prefix);
        self.entries
            .keys()
            .map(PathBuf::from)
            .filter(move |candidate| {
                prefix.as_os_str().is_empty() || normalize(candidate).starts_with(&prefix)
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps working-tree paths to content keys
#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    mode: ResolveMode,
    sidecar: Sidecar,
}

impl KeyResolver {
    /// Resolver for annex symlinks
    pub fn symlinks() -> Self {
        Self::default()
    }

    /// Resolver backed by a sidecar mapping
    pub fn sidecar(sidecar: Sidecar) -> Self {
        Self {
            mode: ResolveMode::Sidecar,
            sidecar,
        }
    }

    pub fn mode(&self) -> ResolveMode {
        self.mode
    }

    pub fn sidecar_entries(&self) -> &Sidecar {
        &self.sidecar
    }

    pub fn resolve(&self, path: &Path) -> FetchResult<ResolvedFile> {
        match self.mode {
            ResolveMode::Symlink => resolve_symlink(path),
            ResolveMode::Sidecar => {
                let raw = self
                    .sidecar
                    .get(path)
                    .ok_or_else(|| FetchError::NotAnnexed {
                        path: path.to_path_buf(),
                        reason: "not present in the sidecar mapping".to_string(),
                    })?;
                Ok(ResolvedFile {
                    key: ContentKey::parse(raw)?,
                    destination: path.to_path_buf(),
                })
            }
        }
    }
}

fn resolve_symlink(path: &Path) -> FetchResult<ResolvedFile> {
    let is_symlink = fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false);
    if !is_symlink {
        return Err(FetchError::NotAnnexed {
            path: path.to_path_buf(),
            reason: "not a symlink, maybe --no-annex?".to_string(),
        });
    }

    let target = fs::read_link(path)?;
    let raw = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| FetchError::MalformedKey {
            key: target.display().to_string(),
            reason: "symlink target has no UTF-8 file name".to_string(),
        })?;
    let key = ContentKey::parse(raw)?;

    // `..` in the target is relative to the directory the link really lives in,
    // which differs from the lexical parent under a symlinked directory.
    let destination = if target.is_absolute() {
        normalize(&target)
    } else {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let base = fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
        normalize(&base.join(&target))
    };

    Ok(ResolvedFile { key, destination })
}

/// Lexically normalize a path, folding `.` and `..` without touching the filesystem
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_key(path: &Path) -> String {
    normalize(path).to_string_lossy().into_owned()
}
