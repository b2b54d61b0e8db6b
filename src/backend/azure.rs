//! Azure Blob Storage downloads
//!
//! Credentials come from a connection string, read from
//! `AZURE_STORAGE_CONNECTION_STRING` or assembled from a local account key
//! file. Account-key connection strings are used to sign each request with
//! the SharedKey scheme; SAS connection strings append their token instead.

use super::{http_client, transport_error, write_response, RemoteBackend};
use crate::cipher::RemoteObjectName;
use crate::config::AzureConfig;
use crate::error::{FetchError, FetchResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use sha2::Sha256;
use std::fmt;
use std::path::Path;

/// Environment variable holding the connection string
pub const CONNECTION_STRING_ENV: &str = "AZURE_STORAGE_CONNECTION_STRING";

/// `x-ms-version` sent with every request
pub const STORAGE_API_VERSION: &str = "2021-08-06";

type HmacSha256 = Hmac<Sha256>;

/// Parsed Azure Storage connection string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    protocol: String,
    account_name: Option<String>,
    account_key: Option<String>,
    endpoint_suffix: String,
    blob_endpoint: Option<String>,
    sas_token: Option<String>,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("protocol", &self.protocol)
            .field("account_name", &self.account_name)
            .field("account_key", &self.account_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint_suffix", &self.endpoint_suffix)
            .field("blob_endpoint", &self.blob_endpoint)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConnectionString {
    /// Parse `Key=Value;Key=Value` pairs
    pub fn parse(raw: &str) -> FetchResult<Self> {
        let mut parsed = Self {
            protocol: "https".to_string(),
            account_name: None,
            account_key: None,
            endpoint_suffix: "core.windows.net".to_string(),
            blob_endpoint: None,
            sas_token: None,
        };

        for pair in raw.trim().split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                FetchError::Config(format!("malformed connection string segment '{}'", name_only(pair)))
            })?;
            let value = value.trim().to_string();
            match name.trim() {
                "DefaultEndpointsProtocol" => parsed.protocol = value,
                "AccountName" => parsed.account_name = Some(value),
                "AccountKey" => parsed.account_key = Some(value),
                "EndpointSuffix" => parsed.endpoint_suffix = value,
                "BlobEndpoint" => parsed.blob_endpoint = Some(value),
                "SharedAccessSignature" => {
                    parsed.sas_token = Some(value.trim_start_matches('?').to_string())
                }
                other => tracing::debug!(field = other, "ignoring connection string field"),
            }
        }

        if parsed.account_key.is_none() && parsed.sas_token.is_none() {
            return Err(FetchError::MissingCredentials(
                "connection string has neither AccountKey nor SharedAccessSignature".to_string(),
            ));
        }
        if parsed.account_key.is_some() && parsed.account_name.is_none() {
            return Err(FetchError::MissingCredentials(
                "connection string has an AccountKey but no AccountName".to_string(),
            ));
        }
        Ok(parsed)
    }

    /// Connection string for an account key read from a key file
    pub fn from_account_key(account: &str, key: &str, endpoint_suffix: &str) -> Self {
        Self {
            protocol: "https".to_string(),
            account_name: Some(account.to_string()),
            account_key: Some(key.trim().to_string()),
            endpoint_suffix: endpoint_suffix.to_string(),
            blob_endpoint: None,
            sas_token: None,
        }
    }

    /// Base URL of the blob service
    pub fn blob_endpoint(&self) -> FetchResult<String> {
        if let Some(endpoint) = &self.blob_endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        let account = self.account_name.as_deref().ok_or_else(|| {
            FetchError::MissingCredentials(
                "connection string has neither BlobEndpoint nor AccountName".to_string(),
            )
        })?;
        Ok(format!(
            "{}://{}.blob.{}",
            self.protocol, account, self.endpoint_suffix
        ))
    }

    /// Look up credentials: the environment first, then the account key file
    ///
    /// Returns `Ok(None)` when neither is present; downloads then fail with
    /// [`FetchError::MissingCredentials`] while fresh files can still be skipped.
    pub fn locate(config: &AzureConfig) -> FetchResult<Option<Self>> {
        if let Ok(raw) = std::env::var(CONNECTION_STRING_ENV) {
            if !raw.trim().is_empty() {
                tracing::debug!("using connection string from {}", CONNECTION_STRING_ENV);
                return Self::parse(&raw).map(Some);
            }
        }

        match std::fs::read_to_string(&config.key_file) {
            Ok(key) if !key.trim().is_empty() => {
                tracing::debug!(key_file = %config.key_file.display(), "using account key file");
                Ok(Some(Self::from_account_key(
                    &config.account,
                    &key,
                    &config.endpoint_suffix,
                )))
            }
            _ => Ok(None),
        }
    }
}

fn name_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or(segment)
}

/// SharedKey signature of a blob GET
///
/// `path` is the URL path of the request (`/container/blob`).
pub fn shared_key_signature(
    account: &str,
    account_key: &str,
    date: &str,
    path: &str,
) -> FetchResult<String> {
    let key = BASE64.decode(account_key.as_bytes()).map_err(|e| {
        FetchError::MissingCredentials(format!("account key is not valid base64: {}", e))
    })?;

    // VERB followed by eleven empty standard headers
    let string_to_sign = format!(
        "GET\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:{}\nx-ms-version:{}\n/{}{}",
        date, STORAGE_API_VERSION, account, path
    );

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|_| FetchError::MissingCredentials("unusable account key".to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Blob client for one container
#[derive(Debug, Clone)]
pub struct AzureBlobBackend {
    http_client: Client,
    container: String,
    prefix: String,
    credentials: Option<ConnectionString>,
}

impl AzureBlobBackend {
    pub fn new(config: &AzureConfig, credentials: Option<ConnectionString>) -> FetchResult<Self> {
        Ok(Self {
            http_client: http_client()?,
            container: config.container.clone(),
            prefix: config.prefix.clone(),
            credentials,
        })
    }

    /// Backend with credentials located through [`ConnectionString::locate`]
    pub fn from_env(config: &AzureConfig) -> FetchResult<Self> {
        let credentials = ConnectionString::locate(config)?;
        if credentials.is_none() {
            tracing::warn!(
                "no Azure credentials: set {} or create {}",
                CONNECTION_STRING_ENV,
                config.key_file.display()
            );
        }
        Self::new(config, credentials)
    }

    fn object_url(
        &self,
        credentials: &ConnectionString,
        object: &RemoteObjectName,
    ) -> FetchResult<Url> {
        let raw = format!(
            "{}/{}/{}{}",
            credentials.blob_endpoint()?,
            self.container,
            self.prefix,
            object
        );
        let mut url = Url::parse(&raw)
            .map_err(|e| FetchError::Config(format!("invalid blob URL '{}': {}", raw, e)))?;
        if credentials.account_key.is_none() {
            url.set_query(credentials.sas_token.as_deref());
        }
        Ok(url)
    }
}

#[async_trait]
impl RemoteBackend for AzureBlobBackend {
    async fn fetch(&self, object: &RemoteObjectName, staging: &Path) -> FetchResult<u64> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            FetchError::MissingCredentials(format!(
                "set {} or provide an account key file",
                CONNECTION_STRING_ENV
            ))
        })?;

        let url = self.object_url(credentials, object)?;
        tracing::debug!(url = %url.path(), "GET azure blob");

        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut request = self
            .http_client
            .get(url.clone())
            .header("x-ms-date", &date)
            .header("x-ms-version", STORAGE_API_VERSION);

        if let (Some(account), Some(key)) = (&credentials.account_name, &credentials.account_key) {
            let signature = shared_key_signature(account, key, &date, url.path())?;
            request = request.header("Authorization", format!("SharedKey {}:{}", account, signature));
        }

        let response = request.send().await.map_err(|e| transport_error(object, e))?;
        write_response(object, response, staging).await
    }

    fn describe(&self) -> String {
        format!("azure://{}/{}", self.container, self.prefix)
    }
}
