//! End-to-end retrieval against mock object stores
//!
//! Each test builds an annex-like working tree in a temp directory, serves
//! the gpg fixtures from a mockito server and checks the run summary and the
//! files on disk.

#![cfg(unix)]

mod common;

use annex_fetch::{
    AzureBlobBackend, AzureConfig, CipherSource, ConnectionString, FetchError, KeyResolver,
    MacAlgorithm, Retriever, Sidecar, TaskContext, TaskOutcome, TaskState,
};
use common::*;
use mockito::Server;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::test]
async fn test_directory_with_one_bad_symlink() {
    let mut server = Server::new_async().await;
    let small = server
        .mock("GET", s3_path(OBJECT_1024).as_str())
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(S1024_GPG)
        .expect(1)
        .create_async()
        .await;
    let large = server
        .mock("GET", s3_path(OBJECT_2048).as_str())
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(S2048_GPG)
        .expect(1)
        .create_async()
        .await;

    let tree = AnnexTree::new();
    tree.add_symlink("data/small.bin", KEY_1024);
    tree.add_symlink("data/nested/large.bin", KEY_2048);
    let broken = tree.add_raw_symlink("data/broken.bin", "../.git/annex/objects/not-a-key");
    let staging = tempfile::tempdir().unwrap();

    let retriever = symlink_retriever(s3_backend(&server.url()), REMOTE_NAME, staging.path(), 2);
    let summary = retriever.run(&[tree.path("data")]).await;

    small.assert_async().await;
    large.assert_async().await;
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.downloaded(), 2);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.bytes_downloaded(), 3072);
    assert!(!summary.is_success());

    let failure = summary.get(&broken).unwrap();
    assert_eq!(failure.outcome.state(), TaskState::Failed);
    assert!(matches!(
        failure.outcome.error(),
        Some(FetchError::MalformedKey { .. })
    ));

    assert_eq!(std::fs::read(tree.object_path(KEY_1024)).unwrap(), plaintext(1024));
    assert_eq!(std::fs::read(tree.object_path(KEY_2048)).unwrap(), plaintext(2048));
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_fresh_file_is_skipped_without_requests() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let tree = AnnexTree::new();
    let link = tree.add_symlink("model.bin", KEY_1024);
    tree.populate(KEY_1024, &vec![0u8; 1024]);
    let staging = tempfile::tempdir().unwrap();

    let retriever = symlink_retriever(s3_backend(&server.url()), REMOTE_NAME, staging.path(), 1);
    let summary = retriever.run(&[link.clone()]).await;

    mock.assert_async().await;
    assert_eq!(summary.skipped(), 1);
    assert!(summary.is_success());
    assert!(matches!(
        summary.get(&link).unwrap().outcome,
        TaskOutcome::Skipped
    ));
    assert_eq!(std::fs::read(tree.object_path(KEY_1024)).unwrap(), vec![0u8; 1024]);
}

#[tokio::test]
async fn test_wrong_size_is_downloaded_again() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", s3_path(OBJECT_1024).as_str())
        .match_query(mockito::Matcher::Any)
        .with_body(S1024_GPG)
        .expect(1)
        .create_async()
        .await;

    let tree = AnnexTree::new();
    let link = tree.add_symlink("model.bin", KEY_1024);
    tree.populate(KEY_1024, b"truncated");
    let staging = tempfile::tempdir().unwrap();

    let retriever = symlink_retriever(s3_backend(&server.url()), REMOTE_NAME, staging.path(), 1);
    let summary = retriever.run(&[link]).await;

    mock.assert_async().await;
    assert_eq!(summary.downloaded(), 1);
    assert_eq!(std::fs::read(tree.object_path(KEY_1024)).unwrap(), plaintext(1024));
}

#[tokio::test]
async fn test_unknown_remote_fails_every_task() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let tree = AnnexTree::new();
    tree.add_symlink("a.bin", KEY_1024);
    tree.add_symlink("b.bin", KEY_2048);
    let staging = tempfile::tempdir().unwrap();

    let retriever = symlink_retriever(
        s3_backend(&server.url()),
        "no-such-remote",
        staging.path(),
        2,
    );
    let summary = retriever
        .run(&[tree.path("a.bin"), tree.path("b.bin")])
        .await;

    mock.assert_async().await;
    assert_eq!(summary.failed(), 2);
    for result in &summary.results {
        match result.outcome.error() {
            Some(FetchError::RemoteNotFound(name)) => assert_eq!(name, "no-such-remote"),
            other => panic!("unexpected outcome for {}: {other:?}", result.path.display()),
        }
    }
}

#[tokio::test]
async fn test_missing_object_is_reported_per_file() {
    let mut server = Server::new_async().await;
    let _found = server
        .mock("GET", s3_path(OBJECT_1024).as_str())
        .match_query(mockito::Matcher::Any)
        .with_body(S1024_GPG)
        .create_async()
        .await;
    let _missing = server
        .mock("GET", s3_path(OBJECT_2048).as_str())
        .match_query(mockito::Matcher::Any)
        .with_status(404)
        .with_body("<Error><Code>NoSuchKey</Code></Error>")
        .create_async()
        .await;

    let tree = AnnexTree::new();
    tree.add_symlink("a.bin", KEY_1024);
    let missing = tree.add_symlink("b.bin", KEY_2048);
    let staging = tempfile::tempdir().unwrap();

    let retriever = symlink_retriever(s3_backend(&server.url()), REMOTE_NAME, staging.path(), 2);
    let summary = retriever.run(&[tree.root().to_path_buf()]).await;

    assert_eq!(summary.downloaded(), 1);
    assert_eq!(summary.failed(), 1);
    let err = summary.get(&missing).unwrap().outcome.error().unwrap();
    assert_eq!(err.kind(), "RemoteFetchError");
    assert!(!err.is_retryable());
    assert!(!tree.object_path(KEY_2048).exists());
}

#[tokio::test]
async fn test_results_independent_of_worker_count() {
    let mut server = Server::new_async().await;
    let _small = server
        .mock("GET", s3_path(OBJECT_1024).as_str())
        .match_query(mockito::Matcher::Any)
        .with_body(S1024_GPG)
        .create_async()
        .await;
    let _large = server
        .mock("GET", s3_path(OBJECT_2048).as_str())
        .match_query(mockito::Matcher::Any)
        .with_body(S2048_GPG)
        .create_async()
        .await;

    let mut outcomes = Vec::new();
    for workers in [1, 3, 8] {
        let tree = AnnexTree::new();
        tree.add_symlink("d/a.bin", KEY_1024);
        tree.add_symlink("d/b.bin", KEY_2048);
        tree.add_raw_symlink("d/bad.bin", "nowhere");
        std::fs::write(tree.path("d/plain.txt"), b"not annexed").unwrap();
        let staging = tempfile::tempdir().unwrap();

        let retriever =
            symlink_retriever(s3_backend(&server.url()), REMOTE_NAME, staging.path(), workers);
        let summary = retriever
            .run(&[tree.path("d"), tree.path("d/plain.txt")])
            .await;

        let by_path: BTreeMap<PathBuf, TaskState> = summary
            .results
            .iter()
            .map(|result| {
                let rel = result.path.strip_prefix(tree.root()).unwrap().to_path_buf();
                (rel, result.outcome.state())
            })
            .collect();
        outcomes.push(by_path);
    }

    assert_eq!(outcomes[0].len(), 4);
    assert_eq!(outcomes[0][&PathBuf::from("d/plain.txt")], TaskState::Failed);
    assert_eq!(outcomes[0][&PathBuf::from("d/b.bin")], TaskState::Done);
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);
}

#[tokio::test]
async fn test_sidecar_mode_with_inline_cipher() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", s3_path(OBJECT_2048).as_str())
        .match_query(mockito::Matcher::Any)
        .with_body(S2048_GPG)
        .expect(1)
        .create_async()
        .await;

    let tree = AnnexTree::new();
    let destination = tree.path("weights/large.bin");
    let sidecar = Sidecar::from_entries([(
        destination.to_string_lossy().into_owned(),
        KEY_2048.to_string(),
    )]);
    let staging = tempfile::tempdir().unwrap();

    let retriever = Retriever::new(TaskContext {
        resolver: KeyResolver::sidecar(sidecar),
        cipher: CipherSource::inline(CIPHER, MacAlgorithm::HmacSha224),
        mac_override: None,
        backend: s3_backend(&server.url()),
        staging_dir: staging.path().to_path_buf(),
    });
    let summary = retriever
        .run(&[tree.path("weights"), tree.path("unlisted.bin")])
        .await;

    mock.assert_async().await;
    assert_eq!(summary.downloaded(), 1);
    assert_eq!(summary.failed(), 1);
    assert_eq!(
        summary
            .get(&tree.path("unlisted.bin"))
            .unwrap()
            .outcome
            .error()
            .unwrap()
            .kind(),
        "NotAnnexedError"
    );
    assert_eq!(std::fs::read(&destination).unwrap(), plaintext(2048));
}

#[tokio::test]
async fn test_azure_blob_through_the_pipeline() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", format!("/git-annex/{}", OBJECT_1024).as_str())
        .match_header("x-ms-version", annex_fetch::STORAGE_API_VERSION)
        .match_header(
            "authorization",
            mockito::Matcher::Regex(r"^SharedKey codesearchtool:".to_string()),
        )
        .with_body(S1024_GPG)
        .expect(1)
        .create_async()
        .await;

    let credentials = ConnectionString::parse(&format!(
        "DefaultEndpointsProtocol=http;AccountName=codesearchtool;AccountKey=c2VjcmV0LWtleQ==;BlobEndpoint={}",
        server.url()
    ))
    .unwrap();
    let backend = AzureBlobBackend::new(&AzureConfig::default(), Some(credentials)).unwrap();

    let tree = AnnexTree::new();
    let link = tree.add_symlink("model.bin", KEY_1024);
    let staging = tempfile::tempdir().unwrap();

    let retriever = symlink_retriever(Arc::new(backend), REMOTE_NAME, staging.path(), 1);
    let summary = retriever.run(&[link]).await;

    mock.assert_async().await;
    assert_eq!(summary.downloaded(), 1);
    assert_eq!(std::fs::read(tree.object_path(KEY_1024)).unwrap(), plaintext(1024));
}

#[tokio::test]
async fn test_azure_without_credentials_still_skips() {
    let tree = AnnexTree::new();
    let fresh = tree.add_symlink("fresh.bin", KEY_1024);
    tree.populate(KEY_1024, &vec![1u8; 1024]);
    let stale = tree.add_symlink("stale.bin", KEY_2048);
    let staging = tempfile::tempdir().unwrap();

    let backend = AzureBlobBackend::new(&AzureConfig::default(), None).unwrap();
    let retriever = symlink_retriever(Arc::new(backend), REMOTE_NAME, staging.path(), 2);
    let summary = retriever.run(&[fresh.clone(), stale.clone()]).await;

    assert_eq!(summary.skipped(), 1);
    assert!(matches!(
        summary.get(&stale).unwrap().outcome.error(),
        Some(FetchError::MissingCredentials(_))
    ));
}
