//! Shared-cipher key derivation for encrypted special remotes
//!
//! With `encryption=shared`, git-annex stores a base64 cipher in the remote
//! log. Once decoded, the cipher is split in two:
//!
//! - the first 256 bytes are the HMAC secret used to hide key names: an
//!   object for key `K` is stored remotely as `GPG<MAC>--hex(HMAC(K))`
//! - the remaining bytes, minus the trailing newline, are the passphrase
//!   the object contents were symmetrically encrypted with
//!
//! Both parts are derived again for every download and never written out.

use crate::error::{FetchError, FetchResult};
use crate::key::ContentKey;
use crate::remote::RemoteLog;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Length of the HMAC secret at the start of a decoded cipher
pub const HMAC_SECRET_LEN: usize = 256;

/// Keyed digest used to derive remote object names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacAlgorithm {
    #[serde(rename = "HMACSHA1")]
    HmacSha1,
    #[serde(rename = "HMACSHA224")]
    HmacSha224,
    #[serde(rename = "HMACSHA256")]
    HmacSha256,
    #[serde(rename = "HMACSHA384")]
    HmacSha384,
    #[serde(rename = "HMACSHA512")]
    HmacSha512,
}

impl MacAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMACSHA1",
            Self::HmacSha224 => "HMACSHA224",
            Self::HmacSha256 => "HMACSHA256",
            Self::HmacSha384 => "HMACSHA384",
            Self::HmacSha512 => "HMACSHA512",
        }
    }

    /// Lowercase hex HMAC of `data` under `key`
    pub fn hex_digest(&self, key: &[u8], data: &[u8]) -> FetchResult<String> {
        match self {
            Self::HmacSha1 => keyed_hex::<Hmac<Sha1>>(key, data),
            Self::HmacSha224 => keyed_hex::<Hmac<Sha224>>(key, data),
            Self::HmacSha256 => keyed_hex::<Hmac<Sha256>>(key, data),
            Self::HmacSha384 => keyed_hex::<Hmac<Sha384>>(key, data),
            Self::HmacSha512 => keyed_hex::<Hmac<Sha512>>(key, data),
        }
    }
}

fn keyed_hex<M>(key: &[u8], data: &[u8]) -> FetchResult<String>
where
    M: Mac + KeyInit,
{
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| FetchError::CipherDerivation("HMAC initialization failed".to_string()))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MacAlgorithm {
    type Err = FetchError;

    /// Accepts `HMACSHA224`, `hmacsha224` or just `sha224`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let digest = upper.strip_prefix("HMAC").unwrap_or(&upper);
        match digest {
            "SHA1" => Ok(Self::HmacSha1),
            "SHA224" => Ok(Self::HmacSha224),
            "SHA256" => Ok(Self::HmacSha256),
            "SHA384" => Ok(Self::HmacSha384),
            "SHA512" => Ok(Self::HmacSha512),
            _ => Err(FetchError::Config(format!("unsupported MAC algorithm '{}'", s))),
        }
    }
}

/// Name under which an encrypted object is stored on the remote
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteObjectName(String);

impl RemoteObjectName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded shared cipher
#[derive(Clone, PartialEq, Eq)]
pub struct CipherMaterial {
    hmac_secret: Vec<u8>,
    passphrase: Vec<u8>,
}

impl fmt::Debug for CipherMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherMaterial")
            .field("hmac_secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl CipherMaterial {
    /// Decode a `cipher=` value from the remote log
    pub fn from_base64(blob: &str) -> FetchResult<Self> {
        let compact: String = blob.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let decoded = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| FetchError::CipherDerivation(format!("invalid base64 cipher: {}", e)))?;

        if decoded.len() <= HMAC_SECRET_LEN + 1 {
            return Err(FetchError::CipherDerivation(format!(
                "cipher too short: {} bytes, expected more than {}",
                decoded.len(),
                HMAC_SECRET_LEN + 1
            )));
        }

        let stripped = trim_newlines(&decoded);
        if stripped.len() < HMAC_SECRET_LEN {
            return Err(FetchError::CipherDerivation(
                "cipher shorter than the HMAC secret once newlines are stripped".to_string(),
            ));
        }

        Ok(Self {
            hmac_secret: stripped[..HMAC_SECRET_LEN].to_vec(),
            passphrase: decoded[HMAC_SECRET_LEN..decoded.len() - 1].to_vec(),
        })
    }

    pub fn hmac_secret(&self) -> &[u8] {
        &self.hmac_secret
    }

    /// Passphrase for the symmetric OpenPGP layer
    pub fn passphrase(&self) -> FetchResult<&str> {
        std::str::from_utf8(&self.passphrase)
            .map_err(|_| FetchError::CipherDerivation("passphrase is not valid UTF-8".to_string()))
    }

    /// Remote object name for `key`: `GPG<MAC>--<hex digest>`
    pub fn object_name(&self, key: &ContentKey, mac: MacAlgorithm) -> FetchResult<RemoteObjectName> {
        let digest = mac.hex_digest(&self.hmac_secret, key.as_str().as_bytes())?;
        Ok(RemoteObjectName(format!("GPG{}--{}", mac, digest.trim())))
    }
}

fn trim_newlines(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b'\n').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != b'\n').map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Everything a download of one key needs from the cipher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedCipher {
    pub object_name: RemoteObjectName,
    pub passphrase: String,
}

/// Where the shared cipher comes from
#[derive(Debug, Clone)]
pub enum CipherSource {
    /// The `cipher=` field of a named remote in the remote log
    Remote { log: RemoteLog, name: String },
    /// A cipher given directly, e.g. through `GIT_ANNEX_CIPHER`
    Inline { blob: String, mac: MacAlgorithm },
}

impl CipherSource {
    pub fn remote(log: RemoteLog, name: impl Into<String>) -> Self {
        Self::Remote {
            log,
            name: name.into(),
        }
    }

    pub fn inline(blob: impl Into<String>, mac: MacAlgorithm) -> Self {
        Self::Inline {
            blob: blob.into(),
            mac,
        }
    }

    /// Derive the object name and passphrase for `key`
    ///
    /// `mac_override` replaces the algorithm declared by the remote.
    pub fn derive(
        &self,
        key: &ContentKey,
        mac_override: Option<MacAlgorithm>,
    ) -> FetchResult<DerivedCipher> {
        let (blob, declared) = match self {
            Self::Remote { log, name } => {
                let remote = log.find(name)?;
                let blob = remote
                    .cipher()
                    .ok_or_else(|| FetchError::CipherFieldMissing(name.clone()))?;
                (blob, remote.mac()?)
            }
            Self::Inline { blob, mac } => (blob.as_str(), *mac),
        };

        let material = CipherMaterial::from_base64(blob)?;
        let object_name = material.object_name(key, mac_override.unwrap_or(declared))?;
        Ok(DerivedCipher {
            object_name,
            passphrase: material.passphrase()?.to_string(),
        })
    }
}
