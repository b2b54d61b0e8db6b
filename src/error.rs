//! Unified error type for annex retrieval
//!
//! Every stage of the pipeline returns [`FetchError`]. Per-file variants are
//! caught at the task boundary and reported in a failed
//! [`TaskResult`](crate::TaskResult); the fatal ones stop a run before any
//! task is scheduled.
//!
//! # Example
//!
//! ```no_run
//! use annex_fetch::{ContentKey, FetchError};
//!
//! fn expected_size(raw: &str) -> Result<u64, FetchError> {
//!     Ok(ContentKey::parse(raw)?.size())
//! }
//! ```

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while resolving, fetching or decrypting annexed content
///
/// # Error Categories
///
/// - **Resolution**: the path is not annexed or its key is malformed
/// - **Cipher**: the remote or its cipher cannot be found or decoded
/// - **Transfer**: credentials are missing or the object store refused the GET
/// - **Decryption**: the OpenPGP payload could not be decrypted or written
/// - **Configuration**: nothing could succeed; the run is aborted
#[derive(Debug, Error)]
pub enum FetchError {
    /// The path is neither a symlink nor present in the sidecar mapping
    #[error("'{}' is not an annexed file: {reason}", path.display())]
    NotAnnexed { path: PathBuf, reason: String },

    /// The key has no parseable `s<N>` size field
    #[error("malformed annex key '{key}': {reason}")]
    MalformedKey { key: String, reason: String },

    /// No entry of the remote log carries the requested name
    #[error("remote '{0}' not found in the remote log")]
    RemoteNotFound(String),

    /// The remote exists but has no `cipher=` field
    #[error("remote '{0}' has no cipher field (is it encrypted with encryption=shared?)")]
    CipherFieldMissing(String),

    /// The cipher blob is not valid base64 or is too short
    #[error("cipher derivation failed: {0}")]
    CipherDerivation(String),

    /// Object store credentials could not be located
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// The object store transfer failed
    #[error("fetching '{object}' failed: {message}")]
    RemoteFetch {
        object: String,
        status: Option<u16>,
        message: String,
    },

    /// Bad passphrase or corrupt ciphertext
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The destination cannot be written (usually a locked annex file)
    #[error("permission denied writing '{}'", path.display())]
    FilesystemPermission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The remote log holds no remotes at all
    #[error("no remotes found in the remote log")]
    NoRemotes,

    /// Invalid settings or an unusable configuration file
    #[error("configuration error: {0}")]
    Config(String),

    /// The sidecar mapping could not be parsed
    #[error("sidecar error: {0}")]
    Sidecar(#[from] serde_json::Error),

    /// A git or git-annex command failed
    #[error("git command failed: {0}")]
    Git(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    /// Stable label for the variant, used in per-file failure lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAnnexed { .. } => "NotAnnexedError",
            Self::MalformedKey { .. } => "MalformedKeyError",
            Self::RemoteNotFound(_) => "RemoteNotFoundError",
            Self::CipherFieldMissing(_) => "CipherFieldMissingError",
            Self::CipherDerivation(_) => "CipherDerivationError",
            Self::MissingCredentials(_) => "MissingCredentialsError",
            Self::RemoteFetch { .. } => "RemoteFetchError",
            Self::Decryption(_) => "DecryptionError",
            Self::FilesystemPermission { .. } => "FilesystemPermissionError",
            Self::NoRemotes => "NoRemotesError",
            Self::Config(_) => "ConfigError",
            Self::Sidecar(_) => "SidecarError",
            Self::Git(_) => "GitError",
            Self::Io(_) => "IoError",
        }
    }

    /// Returns true if the error is potentially retryable
    ///
    /// Only transport failures qualify: timeouts, connection errors and 5xx
    /// responses. The pipeline itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteFetch { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 429,
                None => true,
            },
            _ => false,
        }
    }

    /// Returns true if no task of the run could succeed after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoRemotes | Self::Config(_) | Self::Sidecar(_) | Self::Git(_)
        )
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NotAnnexed { .. } => {
                Some("pass --no-annex to resolve keys through the sidecar mapping".to_string())
            }
            Self::FilesystemPermission { path, .. } => Some(format!(
                "the annexed file is read-only; run 'git annex unlock {}' to enable write access",
                path.display()
            )),
            Self::MissingCredentials(_) => Some(
                "set AZURE_STORAGE_CONNECTION_STRING or provide the account key file".to_string(),
            ),
            Self::RemoteNotFound(_) => {
                Some("check the remote name with 'git show git-annex:remote.log'".to_string())
            }
            _ => None,
        }
    }
}

/// Result type for retrieval operations
pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = FetchError::MalformedKey {
            key: "SHA256E--abc".to_string(),
            reason: "missing size field".to_string(),
        };
        assert_eq!(err.kind(), "MalformedKeyError");
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());

        assert_eq!(
            FetchError::RemoteNotFound("origin".to_string()).kind(),
            "RemoteNotFoundError"
        );
        assert!(FetchError::NoRemotes.is_fatal());
    }

    #[test]
    fn test_retryable_transport_errors() {
        let server_error = FetchError::RemoteFetch {
            object: "GPGHMACSHA224--00".to_string(),
            status: Some(503),
            message: "unavailable".to_string(),
        };
        assert!(server_error.is_retryable());

        let not_found = FetchError::RemoteFetch {
            object: "GPGHMACSHA224--00".to_string(),
            status: Some(404),
            message: "not found".to_string(),
        };
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_permission_suggestion_mentions_unlock() {
        let err = FetchError::FilesystemPermission {
            path: PathBuf::from("data/model.bin"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        let hint = err.suggestion().unwrap();
        assert!(hint.contains("git annex unlock data/model.bin"));
        assert!(err.to_string().contains("permission denied"));
    }
}
