//! Retrieval orchestrator
//!
//! [`Retriever`] expands the requested paths into [`DownloadTask`]s and runs
//! them on a fixed pool of workers. Workers pull tasks from a bounded queue
//! and report one [`TaskResult`] each; a failing task never affects its
//! siblings.

use crate::backend::{AzureBlobBackend, RemoteBackend, S3Backend};
use crate::cipher::{CipherSource, MacAlgorithm};
use crate::config::{FetchConfig, StoreKind, CIPHER_ENV};
use crate::error::FetchResult;
use crate::key::{normalize, KeyResolver, ResolveMode, Sidecar};
use crate::pipeline::{run_task, DownloadTask, TaskContext, TaskOutcome, TaskResult};
use crate::remote::RemoteLog;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::Instrument;
use walkdir::WalkDir;

/// MAC used with a cipher given through the environment, matching the public remote
const INLINE_CIPHER_MAC: MacAlgorithm = MacAlgorithm::HmacSha224;

/// Files selected by path expansion, plus the entries the walk could not read
#[derive(Debug, Default)]
pub struct Expansion {
    pub files: Vec<PathBuf>,
    /// Already failed; reported as they are without being queued
    pub unreadable: Vec<TaskResult>,
}

/// Results of one run
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<TaskResult>,
}

impl RunSummary {
    pub fn downloaded(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Downloaded { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TaskOutcome::Failed(_)))
    }

    /// Total plaintext bytes written
    pub fn bytes_downloaded(&self) -> u64 {
        self.results
            .iter()
            .map(|result| match result.outcome {
                TaskOutcome::Downloaded { bytes } => bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskResult> {
        self.results
            .iter()
            .filter(|result| matches!(result.outcome, TaskOutcome::Failed(_)))
    }

    /// True when no task failed
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Result for `path`, if it was part of the run
    pub fn get(&self, path: &Path) -> Option<&TaskResult> {
        self.results.iter().find(|result| result.path == path)
    }

    fn count(&self, predicate: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }
}

/// Runs retrieval tasks on a worker pool
#[derive(Debug, Clone)]
pub struct Retriever {
    ctx: Arc<TaskContext>,
    workers: usize,
}

impl Retriever {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            workers: 1,
        }
    }

    /// Set the number of concurrent workers (at least one)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Assemble a retriever from settings
    ///
    /// Loading the remote log or the sidecar happens here, so problems that
    /// would fail every file are reported before any task starts.
    pub fn from_config(config: &FetchConfig) -> FetchResult<Self> {
        config.validate()?;

        let resolver = if config.no_annex {
            KeyResolver::sidecar(Sidecar::load(&config.sidecar)?)
        } else {
            KeyResolver::symlinks()
        };

        let inline_cipher = if config.no_annex {
            std::env::var(CIPHER_ENV)
                .ok()
                .filter(|blob| !blob.trim().is_empty())
        } else {
            None
        };
        let cipher = match inline_cipher {
            Some(blob) => {
                tracing::debug!("using cipher from {}", CIPHER_ENV);
                CipherSource::inline(blob, INLINE_CIPHER_MAC)
            }
            None => CipherSource::remote(
                RemoteLog::from_git(&config.repo_dir)?,
                config.remote_name.clone(),
            ),
        };

        let backend: Arc<dyn RemoteBackend> = match config.store {
            StoreKind::AwsS3 => Arc::new(S3Backend::new(&config.s3)?),
            StoreKind::AzureBlob => Arc::new(AzureBlobBackend::from_env(&config.azure)?),
        };

        let ctx = TaskContext {
            resolver,
            cipher,
            mac_override: config.mac,
            backend,
            staging_dir: config.staging_dir.clone(),
        };
        Ok(Self::new(ctx).with_workers(config.workers))
    }

    /// Expand `paths` into the files to retrieve
    ///
    /// Directories are walked recursively. With annex symlinks only the
    /// symlinks found inside directories are kept; with a sidecar every entry
    /// under an argument is selected. Explicit arguments that match nothing
    /// are kept so they report why they could not be resolved. Duplicates
    /// are dropped, keeping the first occurrence.
    pub fn expand_paths(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        self.expand(paths).files
    }

    /// Like [`expand_paths`](Self::expand_paths), also returning a failed
    /// result for every directory entry the walk could not read
    pub fn expand(&self, paths: &[PathBuf]) -> Expansion {
        let mut seen = HashSet::new();
        let mut expansion = Expansion::default();

        for arg in paths {
            let candidates = match self.ctx.resolver.mode() {
                ResolveMode::Symlink => expand_symlinks(arg, &mut expansion.unreadable),
                ResolveMode::Sidecar => {
                    let matched: Vec<PathBuf> = self
                        .ctx
                        .resolver
                        .sidecar_entries()
                        .paths_under(arg)
                        .collect();
                    if matched.is_empty() {
                        vec![arg.clone()]
                    } else {
                        matched
                    }
                }
            };

            for path in candidates {
                if seen.insert(normalize(&path)) {
                    expansion.files.push(path);
                }
            }
        }
        expansion
    }

    /// Retrieve every file under `paths`
    pub async fn run(&self, paths: &[PathBuf]) -> RunSummary {
        let Expansion { files, unreadable } = self.expand(paths);
        let span = tracing::info_span!(
            "run",
            workers = self.workers,
            files = files.len(),
            unreadable = unreadable.len()
        );
        tracing::info!(parent: &span, backend = %self.ctx.backend.describe(), "starting retrieval");

        let (task_tx, task_rx) = mpsc::channel::<DownloadTask>(self.workers * 2);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TaskResult>();

        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&task_rx);
            let results = result_tx.clone();
            pool.spawn(
                async move {
                    loop {
                        let next = queue.lock().await.recv().await;
                        let Some(task) = next else { break };
                        if results.send(run_task(&ctx, task).await).is_err() {
                            break;
                        }
                    }
                    tracing::debug!(worker, "worker finished");
                }
                .instrument(span.clone()),
            );
        }
        drop(result_tx);

        for (id, path) in files.into_iter().enumerate() {
            if task_tx.send(DownloadTask::new(id, path)).await.is_err() {
                tracing::warn!(parent: &span, "all workers exited early");
                break;
            }
        }
        drop(task_tx);

        let mut summary = RunSummary {
            results: unreadable,
        };
        while let Some(result) = result_rx.recv().await {
            summary.results.push(result);
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(parent: &span, error = %err, "worker task panicked");
            }
        }

        tracing::info!(
            parent: &span,
            downloaded = summary.downloaded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "retrieval finished"
        );
        summary
    }
}

fn expand_symlinks(arg: &Path, unreadable: &mut Vec<TaskResult>) -> Vec<PathBuf> {
    let is_dir = fs::symlink_metadata(arg)
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return vec![arg.to_path_buf()];
    }

    let mut links = Vec::new();
    for entry in WalkDir::new(arg).follow_links(false).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.path_is_symlink() => links.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => {
                let path = err.path().unwrap_or(arg).to_path_buf();
                tracing::warn!(path = %path.display(), error = %err, "cannot read directory entry");
                unreadable.push(TaskResult {
                    path,
                    outcome: TaskOutcome::Failed(walk_error(&err).into()),
                });
            }
        }
    }
    links
}

/// Keep the I/O error kind of a walk failure, with the path in the message
fn walk_error(err: &walkdir::Error) -> io::Error {
    let kind = err
        .io_error()
        .map(|source| source.kind())
        .unwrap_or(io::ErrorKind::Other);
    io::Error::new(kind, err.to_string())
}
