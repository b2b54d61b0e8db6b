//! gadown: download encrypted git-annex files
//!
//! # Usage
//!
//! ```bash
//! # Fetch annexed files (symlinks) from the public S3 remote
//! gadown models/ data/weights.bin
//!
//! # Without git-annex, using a sidecar written by `export-keys`
//! GIT_ANNEX_CIPHER=... gadown --no-annex --workers 4 models/
//!
//! # From Azure Blob Storage
//! AZURE_STORAGE_CONNECTION_STRING=... gadown --store azure-blob models/
//!
//! # Write the sidecar mapping (needs git-annex)
//! gadown export-keys
//! ```
//!
//! # Environment Variables
//!
//! - `AZURE_STORAGE_CONNECTION_STRING` - Azure credentials
//! - `GIT_ANNEX_CIPHER` - cipher used with `--no-annex` instead of the remote log
//! - `DEBUG` - any value enables debug logging, also written to `gadown.log`
//! - `RUST_LOG` - log filter, overrides the defaults above
//!
//! A `.env` file in the working directory is loaded first; variables already
//! set in the environment win.

use annex_fetch::{
    export_keys, FetchConfig, FetchError, MacAlgorithm, Retriever, RunSummary, StoreKind,
    TaskOutcome, DEFAULT_SIDECAR,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "DEBUG";
const DEBUG_LOG_FILE: &str = "gadown.log";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "gadown")]
#[command(about = "Download and decrypt git-annex files from S3 or Azure Blob Storage")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Files or directories to download
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Object store holding the encrypted objects
    #[arg(long, value_enum)]
    store: Option<Store>,

    /// Resolve keys through the sidecar mapping instead of annex symlinks
    #[arg(long)]
    no_annex: bool,

    /// Sidecar mapping file used with --no-annex
    #[arg(long)]
    sidecar: Option<PathBuf>,

    /// Number of concurrent downloads
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    workers: Option<u16>,

    /// Name of the remote whose cipher is used
    #[arg(long)]
    remote: Option<String>,

    /// MAC algorithm used to name remote objects (e.g. HMACSHA224)
    #[arg(long, value_parser = parse_mac)]
    mac: Option<MacAlgorithm>,

    /// S3 bucket
    #[arg(long)]
    bucket: Option<String>,

    /// Key prefix inside the bucket or container
    #[arg(long)]
    prefix: Option<String>,

    /// S3 region
    #[arg(long)]
    region: Option<String>,

    /// S3 endpoint override (path-style requests)
    #[arg(long)]
    endpoint: Option<String>,

    /// Azure container
    #[arg(long)]
    container: Option<String>,

    /// Azure storage account used with the key file
    #[arg(long)]
    account: Option<String>,

    /// Directory for encrypted objects awaiting decryption
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// JSON configuration file; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the path to key mapping of every annexed file
    ExportKeys {
        /// Output file
        #[arg(long, default_value = DEFAULT_SIDECAR)]
        sidecar: PathBuf,
        /// Repository to export from
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Store {
    #[value(name = "aws-s3", alias = "s3")]
    AwsS3,
    #[value(name = "azure-blob", alias = "azure")]
    AzureBlob,
}

impl From<Store> for StoreKind {
    fn from(store: Store) -> Self {
        match store {
            Store::AwsS3 => StoreKind::AwsS3,
            Store::AzureBlob => StoreKind::AzureBlob,
        }
    }
}

fn parse_mac(s: &str) -> Result<MacAlgorithm, String> {
    s.parse().map_err(|e: FetchError| e.to_string())
}

// ============================================================================
// Configuration
// ============================================================================

impl Cli {
    /// Settings from the optional config file with flags applied on top
    fn fetch_config(&self) -> Result<FetchConfig, FetchError> {
        let mut config = match &self.config {
            Some(path) => FetchConfig::load(path)?,
            None => FetchConfig::default(),
        };

        if let Some(store) = self.store {
            config.store = store.into();
        }
        if self.no_annex {
            config.no_annex = true;
        }
        if let Some(sidecar) = &self.sidecar {
            config.sidecar = sidecar.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = usize::from(workers);
        }
        if let Some(remote) = &self.remote {
            config.remote_name = remote.clone();
        }
        if self.mac.is_some() {
            config.mac = self.mac;
        }
        if let Some(bucket) = &self.bucket {
            config.s3.bucket = bucket.clone();
        }
        if let Some(prefix) = &self.prefix {
            match config.store {
                StoreKind::AwsS3 => config.s3.prefix = prefix.clone(),
                StoreKind::AzureBlob => config.azure.prefix = prefix.clone(),
            }
        }
        if let Some(region) = &self.region {
            config.s3.region = region.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.s3.endpoint = Some(endpoint.clone());
        }
        if let Some(container) = &self.container {
            config.azure.container = container.clone();
        }
        if let Some(account) = &self.account {
            config.azure.account = account.clone();
        }
        if let Some(staging_dir) = &self.staging_dir {
            config.staging_dir = staging_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing() {
    let debug = std::env::var_os(DEBUG_ENV).is_some();
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());

    let file_layer = if debug {
        match open_debug_log(Path::new(DEBUG_LOG_FILE)) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            ),
            Err(err) => {
                eprintln!("cannot open {}: {}", DEBUG_LOG_FILE, err);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

/// Open the debug log for appending so earlier runs are kept
fn open_debug_log(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

// ============================================================================
// Commands
// ============================================================================

async fn download(cli: &Cli) -> ExitCode {
    let config = match cli.fetch_config() {
        Ok(config) => config,
        Err(err) => return fatal(&err),
    };
    let retriever = match Retriever::from_config(&config) {
        Ok(retriever) => retriever,
        Err(err) => return fatal(&err),
    };

    let summary = retriever.run(&cli.paths).await;
    report(&summary);

    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn export(sidecar: &Path, repo: &Path) -> ExitCode {
    match export_keys(repo, sidecar) {
        Ok(mapping) => {
            println!("Wrote {} keys to {}", mapping.len(), sidecar.display());
            ExitCode::SUCCESS
        }
        Err(err) => fatal(&err),
    }
}

fn report(summary: &RunSummary) {
    for result in summary.failures() {
        if let TaskOutcome::Failed(err) = &result.outcome {
            eprintln!("{}: {}: {}", result.path.display(), err.kind(), err);
            if let Some(hint) = err.suggestion() {
                eprintln!("\t{}", hint);
            }
        }
    }

    println!(
        "{} downloaded ({} bytes), {} skipped, {} failed",
        summary.downloaded(),
        summary.bytes_downloaded(),
        summary.skipped(),
        summary.failed()
    );
}

fn fatal(err: &FetchError) -> ExitCode {
    eprintln!("{}: {}", err.kind(), err);
    if let Some(hint) = err.suggestion() {
        eprintln!("\t{}", hint);
    }
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    match &cli.command {
        Some(Commands::ExportKeys { sidecar, repo }) => export(sidecar, repo),
        None => download(&cli).await,
    }
}
