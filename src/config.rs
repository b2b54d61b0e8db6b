//! Retrieval settings
//!
//! Every field has a default matching the public `crypto-public-s3` remote,
//! so an empty JSON object is a valid configuration. The CLI loads an
//! optional JSON file and then applies its flags on top.

use crate::cipher::MacAlgorithm;
use crate::error::{FetchError, FetchResult};
use crate::key::DEFAULT_SIDECAR;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable holding a cipher for `--no-annex` runs
pub const CIPHER_ENV: &str = "GIT_ANNEX_CIPHER";

/// Which object store the encrypted objects are fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    #[default]
    AwsS3,
    AzureBlob,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwsS3 => f.write_str("aws-s3"),
            Self::AzureBlob => f.write_str("azure-blob"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws-s3" | "s3" => Ok(Self::AwsS3),
            "azure-blob" | "azure" => Ok(Self::AzureBlob),
            other => Err(FetchError::Config(format!(
                "unsupported store '{}', expected aws-s3 or azure-blob",
                other
            ))),
        }
    }
}

/// Anonymous S3 settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Prepended to every object name
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Path-style endpoint override (MinIO, local mocks)
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            prefix: default_s3_prefix(),
            region: default_region(),
            endpoint: None,
        }
    }
}

/// Azure Blob settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureConfig {
    /// Account used with the key file fallback
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_endpoint_suffix")]
    pub endpoint_suffix: String,
    /// File holding the account key when no connection string is set
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            container: default_container(),
            endpoint_suffix: default_endpoint_suffix(),
            key_file: default_key_file(),
            prefix: String::new(),
        }
    }
}

/// Settings for one retrieval run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub store: StoreKind,
    /// Number of concurrent download workers (1 = sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Resolve keys through the sidecar instead of annex symlinks
    #[serde(default)]
    pub no_annex: bool,
    #[serde(default = "default_sidecar")]
    pub sidecar: PathBuf,
    /// Remote whose cipher is read from the remote log
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
    /// Overrides the MAC algorithm declared by the remote
    #[serde(default)]
    pub mac: Option<MacAlgorithm>,
    /// Where encrypted objects are staged before decryption
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Repository the remote log is read from
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub azure: AzureConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            workers: default_workers(),
            no_annex: false,
            sidecar: default_sidecar(),
            remote_name: default_remote_name(),
            mac: None,
            staging_dir: default_staging_dir(),
            repo_dir: default_repo_dir(),
            s3: S3Config::default(),
            azure: AzureConfig::default(),
        }
    }
}

impl FetchConfig {
    pub fn from_json(json: &str) -> FetchResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FetchError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> FetchResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            FetchError::Config(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> FetchResult<()> {
        if self.workers == 0 {
            return Err(FetchError::Config("workers must be at least 1".to_string()));
        }
        if self.remote_name.trim().is_empty() {
            return Err(FetchError::Config("remote name must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    1
}

fn default_sidecar() -> PathBuf {
    PathBuf::from(DEFAULT_SIDECAR)
}

fn default_remote_name() -> String {
    "crypto-public-s3".to_string()
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_bucket() -> String {
    "teia-codesearch-cryptopublic".to_string()
}

fn default_s3_prefix() -> String {
    "crypto-public-s3/".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_account() -> String {
    "codesearchtool".to_string()
}

fn default_container() -> String {
    "git-annex".to_string()
}

fn default_endpoint_suffix() -> String {
    "core.windows.net".to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("azure-storage-blob-write.key")
}
