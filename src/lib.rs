//! Verified retrieval of encrypted git-annex content
//!
//! Files tracked by git-annex are pointer symlinks (or sidecar entries) whose
//! content lives encrypted in an object store. This crate resolves each path
//! to its content key, skips files already present, derives the remote object
//! name and passphrase from the shared cipher, downloads the object from S3 or
//! Azure Blob Storage and decrypts it into place.
//!
//! # Example
//!
//! ```no_run
//! use annex_fetch::{FetchConfig, Retriever};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), annex_fetch::FetchError> {
//! let retriever = Retriever::from_config(&FetchConfig::default())?;
//! let summary = retriever.run(&[PathBuf::from("models")]).await;
//! println!("{} downloaded, {} failed", summary.downloaded(), summary.failed());
//! # Ok(())
//! # }
//! ```

mod backend;
mod cipher;
mod config;
mod decrypt;
mod error;
mod export;
mod freshness;
mod key;
mod pipeline;
mod remote;
mod retriever;

pub mod prelude;

pub use backend::{
    shared_key_signature, AzureBlobBackend, ConnectionString, RemoteBackend, S3Backend,
    CONNECTION_STRING_ENV, REQUEST_TIMEOUT, STORAGE_API_VERSION,
};
pub use cipher::{
    CipherMaterial, CipherSource, DerivedCipher, MacAlgorithm, RemoteObjectName, HMAC_SECRET_LEN,
};
pub use config::{AzureConfig, FetchConfig, S3Config, StoreKind, CIPHER_ENV};
pub use decrypt::{decrypt_bytes, decrypt_to};
pub use error::{FetchError, FetchResult};
pub use export::{export_keys, sidecar_from_listing, write_sidecar};
pub use freshness::needs_download;
pub use key::{ContentKey, KeyResolver, ResolveMode, ResolvedFile, Sidecar, DEFAULT_SIDECAR};
pub use pipeline::{
    run_task, staging_path, DownloadTask, TaskContext, TaskOutcome, TaskResult, TaskState,
};
pub use remote::{RemoteDescriptor, RemoteLog};
pub use retriever::{Expansion, Retriever, RunSummary};
