//! OpenPGP symmetric decryption of staged objects
//!
//! git-annex encrypts shared-cipher content with `gpg --symmetric`, so a
//! staged object is an OpenPGP message made of a symmetric-key encrypted
//! session key packet followed by integrity protected data, usually
//! compressed. Binary and ASCII-armored messages are both accepted.

use crate::error::{FetchError, FetchResult};
use pgp::{Deserializable, Message};
use std::fs;
use std::io::{self, Cursor, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Mode requested for decrypted files before the umask applies
#[cfg(unix)]
const FILE_MODE: u32 = 0o666;

const ARMOR_HEADER: &[u8] = b"-----BEGIN PGP MESSAGE-----";

/// Decrypt an OpenPGP message with `passphrase`, returning the literal data
pub fn decrypt_bytes(ciphertext: &[u8], passphrase: &str) -> FetchResult<Vec<u8>> {
    let message = parse_message(ciphertext)?;

    let passphrase = passphrase.to_string();
    let decrypted = message
        .decrypt_with_password(|| passphrase.clone())
        .map_err(|e| FetchError::Decryption(e.to_string()))?;
    let decompressed = decrypted
        .decompress()
        .map_err(|e| FetchError::Decryption(format!("decompression failed: {}", e)))?;

    decompressed
        .get_content()
        .map_err(|e| FetchError::Decryption(e.to_string()))?
        .ok_or_else(|| FetchError::Decryption("message carries no literal data".to_string()))
}

fn parse_message(bytes: &[u8]) -> FetchResult<Message> {
    let trimmed = trim_leading_whitespace(bytes);
    if trimmed.starts_with(ARMOR_HEADER) {
        let (message, _headers) = Message::from_armor_single(Cursor::new(trimmed))
            .map_err(|e| FetchError::Decryption(format!("invalid armored message: {}", e)))?;
        Ok(message)
    } else {
        Message::from_bytes(Cursor::new(bytes))
            .map_err(|e| FetchError::Decryption(format!("invalid OpenPGP message: {}", e)))
    }
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Decrypt the staged object at `staged` into `destination`
///
/// The plaintext is written to a temporary file next to the destination and
/// then renamed over it, so a failed attempt never leaves a truncated file
/// behind. Returns the number of plaintext bytes written.
pub fn decrypt_to(staged: &Path, passphrase: &str, destination: &Path) -> FetchResult<u64> {
    let ciphertext = fs::read(staged)?;
    let plaintext = decrypt_bytes(&ciphertext, passphrase)?;

    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| write_error(e, destination))?;

    let mut temp = staging_file(parent).map_err(|e| write_error(e, destination))?;
    temp.write_all(&plaintext)
        .map_err(|e| write_error(e, destination))?;
    temp.as_file().sync_all()?;
    temp.persist(destination)
        .map_err(|e| write_error(e.error, destination))?;

    Ok(plaintext.len() as u64)
}

/// Temporary file in `dir` whose mode matches a plain `File::create`
///
/// `NamedTempFile` defaults to `0600`; the persisted file would otherwise be
/// readable by its owner only.
#[cfg(unix)]
fn staging_file(dir: &Path) -> io::Result<NamedTempFile> {
    use std::os::unix::fs::PermissionsExt;

    tempfile::Builder::new()
        .permissions(fs::Permissions::from_mode(FILE_MODE))
        .tempfile_in(dir)
}

#[cfg(not(unix))]
fn staging_file(dir: &Path) -> io::Result<NamedTempFile> {
    NamedTempFile::new_in(dir)
}

/// Map an I/O failure on the destination, singling out locked annex files
pub(crate) fn write_error(err: io::Error, destination: &Path) -> FetchError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        FetchError::FilesystemPermission {
            path: destination.to_path_buf(),
            source: err,
        }
    } else {
        FetchError::Io(err)
    }
}
