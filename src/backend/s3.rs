//! Anonymous S3 downloads
//!
//! The bucket allows public reads, so the SDK client is built without a
//! credentials provider and requests go out unsigned.

use super::{RemoteBackend, REQUEST_TIMEOUT};
use crate::cipher::RemoteObjectName;
use crate::config::S3Config;
use crate::error::{FetchError, FetchResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// Unsigned S3 GET client for one bucket and key prefix
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
}

impl S3Backend {
    /// Create a backend from its settings
    ///
    /// Without an endpoint the SDK addresses the bucket on AWS in `region`;
    /// with one (MinIO, a local mock) requests are path-style.
    pub fn new(config: &S3Config) -> FetchResult<Self> {
        if config.bucket.is_empty() {
            return Err(FetchError::Config("S3 bucket must not be empty".to_string()));
        }

        let endpoint = config.endpoint.as_deref().map(normalize_endpoint);

        // No credentials provider is set, so requests go out unsigned.
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(REQUEST_TIMEOUT)
                    .build(),
            );

        if let Some(endpoint_url) = &endpoint {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            region: config.region.clone(),
            endpoint,
        })
    }

    /// Object key of `object` inside the bucket
    pub fn object_key(&self, object: &RemoteObjectName) -> String {
        format!("{}{}", self.prefix, object)
    }

    /// Region used for endpoint resolution
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Endpoint override, with a scheme
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

/// Add `http://` to endpoints given without a scheme and drop trailing slashes
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Convert an SDK error into a [`FetchError::RemoteFetch`]
///
/// Service errors keep the HTTP status and the S3 error code; dispatch and
/// timeout failures carry no status.
fn map_sdk_error<E>(err: SdkError<E>, object: &RemoteObjectName) -> FetchError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|raw| raw.status().as_u16());
    let message = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code.to_string(),
        _ => DisplayErrorContext(&err).to_string(),
    };

    FetchError::RemoteFetch {
        object: object.to_string(),
        status,
        message,
    }
}

#[async_trait]
impl RemoteBackend for S3Backend {
    #[instrument(skip(self, staging), fields(backend = "s3", bucket = %self.bucket))]
    async fn fetch(&self, object: &RemoteObjectName, staging: &Path) -> FetchResult<u64> {
        let key = self.object_key(object);
        tracing::debug!(%key, "GET s3 object");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, object))?;

        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut body = output.body;
        let mut file = tokio::fs::File::create(staging).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.try_next().await.map_err(|e| FetchError::RemoteFetch {
            object: object.to_string(),
            status: None,
            message: DisplayErrorContext(&e).to_string(),
        })? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
