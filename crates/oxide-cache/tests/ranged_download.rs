//! Segmented and streamed archive downloads.

mod common;

use common::{archive_bytes, fast_retry, init_test_logging};
use oxide_cache::backend::RestBackend;
use oxide_cache::{DownloadOptions, RetryExecutor, ServiceConfig};
use oxide_core::Error;
use std::time::Duration;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ARCHIVE_SIZE: usize = 250;

fn create_backend(server: &MockServer) -> RestBackend {
    RestBackend::new(
        ServiceConfig::new(server.uri(), "test-token"),
        RetryExecutor::new(fast_retry()),
    )
    .expect("failed to create backend")
}

fn segmented() -> DownloadOptions {
    DownloadOptions {
        concurrent: true,
        concurrency: 4,
        segment_size: 64,
        lookup_only: false,
    }
}

async fn mount_probe(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(header("range", "bytes=0-0"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", format!("bytes 0-0/{}", ARCHIVE_SIZE).as_str())
                .set_body_bytes(archive_bytes(1)),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_segment(server: &MockServer, start: usize, end: usize) {
    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(header("range", format!("bytes={}-{}", start, end).as_str()))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {}-{}/{}", start, end, ARCHIVE_SIZE).as_str(),
                )
                .set_body_bytes(archive_bytes(ARCHIVE_SIZE)[start..=end].to_vec()),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_segmented_download_reassembles_archive() {
    init_test_logging();
    let server = MockServer::start().await;

    mount_probe(&server).await;
    for (start, end) in [(0, 63), (64, 127), (128, 191), (192, 249)] {
        mount_segment(&server, start, end).await;
    }

    let dir = tempdir().unwrap();
    let target = dir.path().join("archive.tzst");
    let bytes = create_backend(&server)
        .download_archive(&format!("{}/archive", server.uri()), &target, segmented())
        .await
        .expect("download failed");

    assert_eq!(bytes, ARCHIVE_SIZE as u64);
    assert_eq!(std::fs::read(&target).unwrap(), archive_bytes(ARCHIVE_SIZE));
}

#[tokio::test]
async fn test_segmented_download_falls_back_when_ranges_ignored() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive_bytes(ARCHIVE_SIZE)))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("archive.tzst");
    let bytes = create_backend(&server)
        .download_archive(&format!("{}/archive", server.uri()), &target, segmented())
        .await
        .expect("download failed");

    assert_eq!(bytes, ARCHIVE_SIZE as u64);
    assert_eq!(std::fs::read(&target).unwrap(), archive_bytes(ARCHIVE_SIZE));
}

#[tokio::test]
async fn test_short_segment_is_retried_then_fails() {
    let server = MockServer::start().await;

    mount_probe(&server).await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(header("range", "bytes=0-63"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(archive_bytes(10)))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(archive_bytes(64)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let options = DownloadOptions {
        concurrency: 1,
        ..segmented()
    };
    let result = create_backend(&server)
        .download_archive(
            &format!("{}/archive", server.uri()),
            &dir.path().join("archive.tzst"),
            options,
        )
        .await;

    match result {
        Err(Error::RetriesExhausted { operation, source, .. }) => {
            assert_eq!(operation, "downloadCacheSegment");
            assert!(matches!(*source, Error::Transport(_)));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_segment_times_out() {
    let server = MockServer::start().await;

    mount_probe(&server).await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(header("range", "bytes=0-63"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(archive_bytes(64))
                .set_delay(Duration::from_secs(5)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let mut service = ServiceConfig::new(server.uri(), "test-token");
    service.request_timeout_secs = 1;
    let backend = RestBackend::new(service, RetryExecutor::new(fast_retry())).unwrap();
    let dir = tempdir().unwrap();
    let options = DownloadOptions {
        concurrency: 1,
        ..segmented()
    };

    let result = backend
        .download_archive(
            &format!("{}/archive", server.uri()),
            &dir.path().join("archive.tzst"),
            options,
        )
        .await;

    match result {
        Err(Error::RetriesExhausted { operation, source, .. }) => {
            assert_eq!(operation, "downloadCacheSegment");
            assert!(matches!(*source, Error::Transport(_)));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_download_does_not_send_service_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(403))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive_bytes(32)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("archive.tzst");
    let bytes = create_backend(&server)
        .download_archive(
            &format!("{}/archive", server.uri()),
            &target,
            DownloadOptions::default(),
        )
        .await
        .expect("download failed");
    assert_eq!(bytes, 32);
}

#[tokio::test]
async fn test_stream_download_not_found_is_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let result = create_backend(&server)
        .download_archive(
            &format!("{}/archive", server.uri()),
            &dir.path().join("archive.tzst"),
            DownloadOptions::default(),
        )
        .await;
    match result {
        Err(Error::Service {
            operation, status, ..
        }) => {
            assert_eq!(operation, "downloadCache");
            assert_eq!(status, 404);
        }
        other => panic!("expected service error, got {:?}", other),
    }
}
