//! Object store backends
//!
//! A backend knows how to turn a [`RemoteObjectName`] into an HTTP GET and
//! stream the (still encrypted) body into a staging file. Two variants exist:
//!
//! - [`S3Backend`]: anonymous, unsigned requests against a public bucket
//! - [`AzureBlobBackend`]: connection-string authenticated blob downloads

mod azure;
mod s3;

pub use azure::{
    shared_key_signature, AzureBlobBackend, ConnectionString, CONNECTION_STRING_ENV,
    STORAGE_API_VERSION,
};
pub use s3::S3Backend;

use crate::cipher::RemoteObjectName;
use crate::error::{FetchError, FetchResult};
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Timeout applied to every object store request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Fetches encrypted objects into a staging location
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Download `object` into `staging`, returning the number of bytes written
    async fn fetch(&self, object: &RemoteObjectName, staging: &Path) -> FetchResult<u64>;

    /// Short human readable description for logs
    fn describe(&self) -> String;
}

/// HTTP client shared by the backends
pub(crate) fn http_client() -> FetchResult<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| FetchError::Config(format!("cannot build HTTP client: {}", e)))
}

/// Convert a transport error into a [`FetchError::RemoteFetch`]
pub(crate) fn transport_error(object: &RemoteObjectName, err: reqwest::Error) -> FetchError {
    FetchError::RemoteFetch {
        object: object.to_string(),
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Check the status and stream the response body into `staging`
pub(crate) async fn write_response(
    object: &RemoteObjectName,
    mut response: Response,
    staging: &Path,
) -> FetchResult<u64> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::RemoteFetch {
            object: object.to_string(),
            status: Some(status.as_u16()),
            message: format!("HTTP {}: {}", status, body.trim()),
        });
    }

    if let Some(parent) = staging.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(staging).await?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| transport_error(object, e))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}
