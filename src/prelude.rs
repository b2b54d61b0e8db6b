//! Commonly used types
//!
//! ```rust
//! use annex_fetch::prelude::*;
//!
//! let key = ContentKey::parse("SHA256E-s1024--81a9ef00.bin")?;
//! assert_eq!(key.size(), 1024);
//! # Ok::<(), FetchError>(())
//! ```

pub use crate::backend::RemoteBackend;
pub use crate::cipher::{CipherSource, MacAlgorithm, RemoteObjectName};
pub use crate::config::{FetchConfig, StoreKind};
pub use crate::error::{FetchError, FetchResult};
pub use crate::key::{ContentKey, KeyResolver, Sidecar};
pub use crate::pipeline::{DownloadTask, TaskContext, TaskOutcome, TaskResult};
pub use crate::retriever::{Retriever, RunSummary};
