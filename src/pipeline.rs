//! Per-file retrieval state machine
//!
//! ```text
//! Resolving -> CheckingFreshness -> Skipped
//!                                -> Fetching -> Decrypting -> Done
//! any state -> Failed
//! ```
//!
//! Each [`DownloadTask`] is driven through these states by exactly one
//! worker. Errors never escape a task: they end up in the
//! [`TaskOutcome::Failed`] of its [`TaskResult`].

use crate::backend::RemoteBackend;
use crate::cipher::{CipherSource, MacAlgorithm, RemoteObjectName};
use crate::decrypt::decrypt_to;
use crate::error::{FetchError, FetchResult};
use crate::freshness::needs_download;
use crate::key::KeyResolver;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

/// Where a task currently is in its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Resolving,
    CheckingFreshness,
    Fetching,
    Decrypting,
    Done,
    Skipped,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Resolving => "resolving",
            Self::CheckingFreshness => "checking-freshness",
            Self::Fetching => "fetching",
            Self::Decrypting => "decrypting",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One working-tree path queued for retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: usize,
    pub path: PathBuf,
}

impl DownloadTask {
    pub fn new(id: usize, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }
}

/// How a task ended
#[derive(Debug)]
pub enum TaskOutcome {
    /// Fetched and decrypted; `bytes` is the plaintext length
    Downloaded { bytes: u64 },
    /// The local copy already had the expected size
    Skipped,
    Failed(FetchError),
}

impl TaskOutcome {
    /// Terminal state matching the outcome
    pub fn state(&self) -> TaskState {
        match self {
            Self::Downloaded { .. } => TaskState::Done,
            Self::Skipped => TaskState::Skipped,
            Self::Failed(_) => TaskState::Failed,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Final report for one path
#[derive(Debug)]
pub struct TaskResult {
    pub path: PathBuf,
    pub outcome: TaskOutcome,
}

/// Read-only state shared by every worker of a run
pub struct TaskContext {
    pub resolver: KeyResolver,
    pub cipher: CipherSource,
    pub mac_override: Option<MacAlgorithm>,
    pub backend: Arc<dyn RemoteBackend>,
    pub staging_dir: PathBuf,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("mode", &self.resolver.mode())
            .field("mac_override", &self.mac_override)
            .field("backend", &self.backend.describe())
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

/// Drive `task` to a terminal state
#[instrument(name = "task", skip(ctx, task), fields(id = task.id, path = %task.path.display()))]
pub async fn run_task(ctx: &TaskContext, task: DownloadTask) -> TaskResult {
    let outcome = match process(ctx, &task).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(kind = err.kind(), error = %err, "{}", TaskState::Failed);
            TaskOutcome::Failed(err)
        }
    };

    TaskResult {
        path: task.path,
        outcome,
    }
}

async fn process(ctx: &TaskContext, task: &DownloadTask) -> FetchResult<TaskOutcome> {
    tracing::debug!("{}", TaskState::Resolving);
    let resolved = ctx.resolver.resolve(&task.path)?;
    let expected = resolved.key.size();

    tracing::debug!(
        key = %resolved.key,
        destination = %resolved.destination.display(),
        "{}",
        TaskState::CheckingFreshness
    );
    if !needs_download(&resolved.destination, expected) {
        tracing::info!(size = expected, "{}, already present", TaskState::Skipped);
        return Ok(TaskOutcome::Skipped);
    }

    let derived = ctx.cipher.derive(&resolved.key, ctx.mac_override)?;
    let staging = staging_path(&ctx.staging_dir, derived.object_name.as_str(), task.id);
    tracing::info!(
        object = %derived.object_name,
        backend = %ctx.backend.describe(),
        "{}",
        TaskState::Fetching
    );

    let result = fetch_and_decrypt(
        ctx,
        &derived.object_name,
        &derived.passphrase,
        &staging,
        &resolved.destination,
    )
    .await;
    if staging.exists() {
        if let Err(err) = std::fs::remove_file(&staging) {
            tracing::debug!(
                staging = %staging.display(),
                error = %err,
                "could not remove staging file"
            );
        }
    }

    let bytes = result?;
    if bytes != expected {
        tracing::warn!(expected, bytes, "decrypted size differs from the key size");
    }
    tracing::info!(bytes, "{}", TaskState::Done);
    Ok(TaskOutcome::Downloaded { bytes })
}

async fn fetch_and_decrypt(
    ctx: &TaskContext,
    object: &RemoteObjectName,
    passphrase: &str,
    staging: &Path,
    destination: &Path,
) -> FetchResult<u64> {
    let fetched = ctx.backend.fetch(object, staging).await?;
    tracing::debug!(fetched, staging = %staging.display(), "{}", TaskState::Decrypting);

    let staged = staging.to_path_buf();
    let passphrase = passphrase.to_string();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || decrypt_to(&staged, &passphrase, &destination))
        .await
        .map_err(|e| FetchError::Decryption(format!("decryption task aborted: {}", e)))?
}

/// Staging file for one task; the task id keeps concurrent downloads of the same object apart
pub fn staging_path(staging_dir: &Path, object: &str, id: usize) -> PathBuf {
    staging_dir.join(format!("{}.{}.gpg", object, id))
}
