//! Common test utilities for annex-fetch integration tests
//!
//! The fixtures under `tests/data` were produced with
//! `gpg --symmetric --cipher-algo AES256 --compress-algo zip` using the
//! passphrase held by [`CIPHER`]. The plaintext of `s<N>.bin.gpg` is
//! [`plaintext(N)`](plaintext).

#![allow(dead_code)]

use annex_fetch::{
    CipherSource, KeyResolver, RemoteBackend, RemoteLog, Retriever, S3Backend, S3Config,
    TaskContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Shared cipher of the test remote (base64, MIME style)
pub const CIPHER: &str = "cmhUdXZxQ2RtUEcwdG1LWFBEWnBBZW1tMXphN3YwZkhodmp3ZGJUMkh3RHF6dU0xNHFIT1hIbHBhQnFDZWZ1djJGU0pnaEI2aFJMZW9zNDd3R0prY1UvMFhYa0hHNXFKd3YxTWtBdVlWYnBTMEpzbzJqS0YwOG1tZjFVTG1tY1czeHZZMjdEZkFOdVJvc2U2MkNITjRYREVqRzFrWkE1a1hYZ3dGVk1BcVRrTnAvdnNndmJSeXNVaUI5b3pJZnozaGxrVjc5N3RwbkJQSkFWQTFCbXpXaW1MVkRQNUdKdFJkOG9TSi9sTno1citKLzh1L003QXNaN25yc29UVjc1WTRzeFZlOVJXbEJhVEY2RTlDUGNnWUJ5OUxtcjRQYVdiUDNndlkxcElYb1FPcmdSYjV2UEc1YzZxU1loellURlEK";

/// Passphrase embedded in [`CIPHER`]
pub const PASSPHRASE: &str = "4sxVe9RWlBaTF6E9CPcgYBy9Lmr4PaWbP3gvY1pIXoQOrgRb5vPG5c6qSYhzYTFQ";

pub const REMOTE_NAME: &str = "crypto-public-s3";
pub const BUCKET: &str = "annex";
pub const PREFIX: &str = "crypto-public-s3/";

pub const KEY_1024: &str =
    "SHA256E-s1024--c0c0e84a8ac70db82f45fb3b6f73bf1b3a13a158fec869f01d939439aae31aff.bin";
pub const OBJECT_1024: &str =
    "GPGHMACSHA224--d9f3ade9e510610a2ac87bb75b9eabf79bd7ac7a1d404890423a9d8b";
pub const S1024_GPG: &[u8] = include_bytes!("../data/s1024.bin.gpg");

pub const KEY_2048: &str =
    "SHA256E-s2048--71021bc078e53dcd40a029b5bfb78f26e302610f05d7b2bff0ca1aef33b67199.bin";
pub const OBJECT_2048: &str =
    "GPGHMACSHA224--4103ff033614fa2189ea08411650cbb4057b0d0fb3522986a4132504";
pub const S2048_GPG: &[u8] = include_bytes!("../data/s2048.bin.gpg");

pub const HELLO_ASC: &[u8] = include_bytes!("../data/hello.txt.asc");

/// Plaintext of the `s<size>.bin.gpg` fixtures
pub fn plaintext(size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i * 7 + size) % 251) as u8).collect()
}

/// A remote log with an outdated entry, the test remote and an unrelated remote
pub fn remote_log() -> RemoteLog {
    let text = format!(
        "8f2c1b1e-0000-4000-8000-000000000001 name={name} type=S3 encryption=shared mac=HMACSHA1 timestamp=1600000000s\n\
         8f2c1b1e-0000-4000-8000-000000000001 bucket={bucket} cipher={cipher} encryption=shared fileprefix={prefix} mac=HMACSHA224 name={name} type=S3 timestamp=1700000000.5s\n\
         1d9a8e11-0000-4000-8000-000000000002 name=backup type=directory encryption=none timestamp=1650000000s\n",
        name = REMOTE_NAME,
        bucket = BUCKET,
        cipher = CIPHER,
        prefix = PREFIX,
    );
    RemoteLog::parse(&text).expect("test remote log parses")
}

/// S3 backend pointed at a mock server
pub fn s3_backend(endpoint: &str) -> Arc<dyn RemoteBackend> {
    Arc::new(
        S3Backend::new(&S3Config {
            bucket: BUCKET.to_string(),
            prefix: PREFIX.to_string(),
            endpoint: Some(endpoint.to_string()),
            ..S3Config::default()
        })
        .expect("backend builds"),
    )
}

/// Request path of `object` on the mock S3 server; the SDK adds its own query
pub fn s3_path(object: &str) -> String {
    format!("/{}/{}{}", BUCKET, PREFIX, object)
}

/// Retriever resolving annex symlinks with the cipher of `remote`
pub fn symlink_retriever(
    backend: Arc<dyn RemoteBackend>,
    remote: &str,
    staging: &Path,
    workers: usize,
) -> Retriever {
    Retriever::new(TaskContext {
        resolver: KeyResolver::symlinks(),
        cipher: CipherSource::remote(remote_log(), remote),
        mac_override: None,
        backend,
        staging_dir: staging.to_path_buf(),
    })
    .with_workers(workers)
}

/// A working tree laid out the way git-annex lays it out
pub struct AnnexTree {
    dir: TempDir,
}

impl AnnexTree {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Where the content of `key` lives
    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root().join(object_rel(key))
    }

    /// Add an annex pointer symlink at `rel` for `key`
    #[cfg(unix)]
    pub fn add_symlink(&self, rel: &str, key: &str) -> PathBuf {
        let depth = Path::new(rel).components().count().saturating_sub(1);
        let target = format!("{}{}", "../".repeat(depth), object_rel(key));
        self.add_raw_symlink(rel, &target)
    }

    /// Add a symlink at `rel` with an arbitrary target
    #[cfg(unix)]
    pub fn add_raw_symlink(&self, rel: &str, target: &str) -> PathBuf {
        let link = self.path(rel);
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::os::unix::fs::symlink(target, &link).expect("create symlink");
        link
    }

    /// Put content in place for `key`, as if it had been fetched before
    pub fn populate(&self, key: &str, content: &[u8]) {
        let object = self.object_path(key);
        std::fs::create_dir_all(object.parent().expect("object has a parent"))
            .expect("create object dir");
        std::fs::write(object, content).expect("write object");
    }
}

fn object_rel(key: &str) -> String {
    format!(".git/annex/objects/Xk/7q/{key}/{key}")
}
