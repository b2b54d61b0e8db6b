//! Remote configuration from the git-annex remote log
//!
//! `remote.log` on the `git-annex` branch holds one line per configuration
//! change:
//!
//! ```text
//! 2f1c...-uuid cipher=LS0t... encryption=shared mac=HMACSHA224 name=crypto-public-s3 type=S3 timestamp=1600000000.5s
//! ```
//!
//! Lines are appended over time, so for each remote uuid only the line with
//! the newest timestamp is kept.

use crate::cipher::MacAlgorithm;
use crate::error::{FetchError, FetchResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

/// One configured special remote
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDescriptor {
    uuid: String,
    fields: BTreeMap<String, String>,
    timestamp: f64,
}

impl RemoteDescriptor {
    /// Parse one remote log line; returns `None` for blank or field-less lines
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let uuid = tokens.next()?.to_string();

        let mut fields = BTreeMap::new();
        let mut timestamp = 0.0;
        for token in tokens {
            let Some((name, value)) = token.split_once('=') else {
                continue;
            };
            if name == "timestamp" {
                timestamp = value.trim_end_matches('s').parse().unwrap_or(0.0);
            } else {
                fields.insert(name.to_string(), value.to_string());
            }
        }

        if fields.is_empty() {
            return None;
        }
        Some(Self {
            uuid,
            fields,
            timestamp,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name")
    }

    pub fn remote_type(&self) -> Option<&str> {
        self.get("type")
    }

    pub fn encryption(&self) -> Option<&str> {
        self.get("encryption")
    }

    pub fn cipher(&self) -> Option<&str> {
        self.get("cipher")
    }

    /// MAC algorithm declared by the remote; git-annex defaults to HMACSHA1
    pub fn mac(&self) -> FetchResult<MacAlgorithm> {
        match self.get("mac") {
            Some(raw) => raw.parse(),
            None => Ok(MacAlgorithm::HmacSha1),
        }
    }

    /// Any other location parameter (`bucket`, `fileprefix`, `container`, ...)
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

/// All remotes known to the repository, read once per run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteLog {
    remotes: Vec<RemoteDescriptor>,
}

impl RemoteLog {
    /// Parse the remote log, failing with [`FetchError::NoRemotes`] if it is empty
    pub fn parse(text: &str) -> FetchResult<Self> {
        let mut latest: BTreeMap<String, RemoteDescriptor> = BTreeMap::new();
        for descriptor in text.lines().filter_map(RemoteDescriptor::parse_line) {
            let newer = latest
                .get(descriptor.uuid())
                .map_or(true, |current| descriptor.timestamp >= current.timestamp);
            if newer {
                latest.insert(descriptor.uuid.clone(), descriptor);
            }
        }

        if latest.is_empty() {
            return Err(FetchError::NoRemotes);
        }
        Ok(Self {
            remotes: latest.into_values().collect(),
        })
    }

    /// Read `git-annex:remote.log` from the repository at `repo`
    pub fn from_git(repo: &Path) -> FetchResult<Self> {
        let text = git_output(repo, &["show", "git-annex:remote.log"])?;
        tracing::debug!(bytes = text.len(), "loaded remote log");
        Self::parse(&text)
    }

    pub fn remotes(&self) -> &[RemoteDescriptor] {
        &self.remotes
    }

    pub fn find(&self, name: &str) -> FetchResult<&RemoteDescriptor> {
        self.remotes
            .iter()
            .find(|remote| remote.name() == Some(name))
            .ok_or_else(|| FetchError::RemoteNotFound(name.to_string()))
    }

    /// The raw base64 cipher blob of the named remote
    pub fn cipher_for(&self, name: &str) -> FetchResult<&str> {
        self.find(name)?
            .cipher()
            .ok_or_else(|| FetchError::CipherFieldMissing(name.to_string()))
    }
}

/// Run a git command in `repo` and return its stdout
pub(crate) fn git_output(repo: &Path, args: &[&str]) -> FetchResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| FetchError::Git(format!("cannot run git {}: {}", args.join(" "), e)))?;

    if !output.status.success() {
        return Err(FetchError::Git(format!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|e| FetchError::Git(format!("git {} produced non UTF-8 output: {}", args.join(" "), e)))
}
