//! ObjectStore backend over an in-memory bucket: paginated resolution,
//! multipart uploads, aborts and downloads through a session.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{archive_bytes, fast_retry, init_test_logging, paths, upload_options, write_archive};
use oxide_cache::backend::object_store::ObjectPage;
use oxide_cache::backend::{Backend, ObjectStore, ObjectStoreBackend};
use oxide_cache::{
    BackendKind, CacheConfig, CacheRestoreRequest, CacheSaveRequest, CacheSession, ListedEntry,
    ObjectStoreConfig, RetryExecutor,
};
use oxide_core::{Error, Result};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

type Parts = Vec<(i32, Vec<u8>)>;

/// Bucket kept in listing order.
#[derive(Default)]
struct MemoryStore {
    objects: Mutex<Vec<(String, Vec<u8>, Option<DateTime<Utc>>)>>,
    page_size: usize,
    list_calls: AtomicUsize,
    uploads: Mutex<HashMap<String, (String, Parts)>>,
    next_upload: AtomicUsize,
    aborted: Mutex<Vec<String>>,
    fail_part: Option<i32>,
}

impl MemoryStore {
    fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Default::default()
        }
    }

    fn put(&self, key: &str, data: Vec<u8>, hour: u32) {
        let modified = Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single();
        self.objects
            .lock()
            .unwrap()
            .push((key.to_string(), data, modified));
    }

    fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, data, _)| data.clone())
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(&self, continuation_token: Option<String>) -> Result<ObjectPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let start: usize = continuation_token
            .map(|t| t.parse().expect("token is an index"))
            .unwrap_or(0);
        let end = (start + self.page_size.max(1)).min(objects.len());

        Ok(ObjectPage {
            objects: objects[start..end]
                .iter()
                .map(|(key, _, modified)| ListedEntry::new(key.as_str(), *modified))
                .collect(),
            next_token: (end < objects.len()).then(|| end.to_string()),
        })
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads
            .lock()
            .unwrap()
            .insert(id.clone(), (key.to_string(), vec![]));
        Ok(id)
    }

    async fn upload_part(&self, _key: &str, upload_id: &str, part_number: i32, data: Vec<u8>) -> Result<String> {
        if self.fail_part == Some(part_number) {
            return Err(Error::Service {
                operation: "uploadPart".into(),
                status: 503,
                message: "SlowDown".into(),
            });
        }
        let mut uploads = self.uploads.lock().unwrap();
        let (_, parts) = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::Service {
                operation: "uploadPart".into(),
                status: 404,
                message: "NoSuchUpload".into(),
            })?;
        parts.push((part_number, data));
        Ok(format!("etag-{}", part_number))
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: Vec<(i32, String)>) -> Result<()> {
        let (_, mut uploaded) = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| Error::Service {
                operation: "completeMultipartUpload".into(),
                status: 404,
                message: "NoSuchUpload".into(),
            })?;
        uploaded.sort_by_key(|(n, _)| *n);

        let numbers: Vec<i32> = parts.iter().map(|(n, _)| *n).collect();
        let expected: Vec<i32> = (1..=uploaded.len() as i32).collect();
        assert_eq!(numbers, expected, "parts must be complete and ordered");
        for (n, e_tag) in &parts {
            assert_eq!(e_tag, &format!("etag-{}", n));
        }

        let data = uploaded.into_iter().flat_map(|(_, d)| d).collect();
        self.objects
            .lock()
            .unwrap()
            .push((key.to_string(), data, Some(Utc::now())));
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.lock().unwrap().push(upload_id.to_string());
        Ok(())
    }

    async fn get_object(&self, key: &str, path: &Path) -> Result<u64> {
        let data = self.object(key).ok_or_else(|| Error::Service {
            operation: "getObject".into(),
            status: 404,
            message: "NoSuchKey".into(),
        })?;
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }
}

fn session(store: Arc<MemoryStore>) -> CacheSession {
    let config = CacheConfig::object_store(ObjectStoreConfig::new("ci-cache", "AKIA", "secret"))
        .with_retry(fast_retry())
        .with_upload(upload_options(2, 64));
    assert_eq!(BackendKind::select(&config).unwrap(), BackendKind::ObjectStore);

    let backend = Backend::ObjectStore(ObjectStoreBackend::new(store, RetryExecutor::new(fast_retry())));
    CacheSession::with_backend(backend, config)
}

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|k| k.to_string()).collect()
}

#[tokio::test]
async fn test_lookup_falls_back_to_older_entry() {
    init_test_logging();
    let store = Arc::new(MemoryStore::with_page_size(100));
    store.put("k-v1", archive_bytes(8), 1);

    let entry = session(store)
        .lookup(&keys(&["k-v2", "k-v1"]), "ignored")
        .await
        .unwrap()
        .expect("expected fallback hit");
    assert_eq!(entry.key, "k-v1");
}

#[tokio::test]
async fn test_lookup_prefers_primary_over_newer_fallback() {
    let store = Arc::new(MemoryStore::with_page_size(100));
    store.put("k-v1", archive_bytes(8), 9);
    store.put("k-v2", archive_bytes(8), 1);

    let entry = session(store)
        .lookup(&keys(&["k-v2", "k-v1"]), "ignored")
        .await
        .unwrap()
        .expect("expected primary hit");
    assert_eq!(entry.key, "k-v2");
    assert_eq!(entry.location, "k-v2");
}

#[tokio::test]
async fn test_primary_hit_stops_listing_early() {
    let store = Arc::new(MemoryStore::with_page_size(1));
    for (i, key) in ["cargo-a", "cargo-b", "cargo-c", "cargo-d"].iter().enumerate() {
        store.put(key, archive_bytes(4), i as u32);
    }

    let entry = session(store.clone())
        .lookup(&keys(&["cargo-b", "cargo-"]), "ignored")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(entry.key, "cargo-b");
    assert_eq!(store.list_calls(), 2);
}

#[tokio::test]
async fn test_prefix_fallback_reads_every_page() {
    let store = Arc::new(MemoryStore::with_page_size(1));
    store.put("cargo-a", archive_bytes(4), 1);
    store.put("cargo-c", archive_bytes(4), 7);
    store.put("cargo-b", archive_bytes(4), 3);

    let entry = session(store.clone())
        .lookup(&keys(&["cargo-z", "cargo-"]), "ignored")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(entry.key, "cargo-c");
    assert_eq!(store.list_calls(), 3);
}

#[tokio::test]
async fn test_save_uploads_multipart_without_reserve() {
    init_test_logging();
    let store = Arc::new(MemoryStore::with_page_size(100));
    let dir = tempdir().unwrap();
    let archive = write_archive(dir.path(), 250);
    let session = session(store.clone());

    let saved = session
        .save(&CacheSaveRequest::new("build-42", paths(), &archive))
        .await
        .expect("save failed");

    assert_eq!(saved.cache_id, None);
    assert_eq!(saved.size_bytes, 250);
    assert_eq!(store.object("build-42"), Some(archive_bytes(250)));
    assert!(store.aborted.lock().unwrap().is_empty());
    assert_eq!(session.stats().uploads, 1);
}

#[tokio::test]
async fn test_failed_part_aborts_upload() {
    let store = Arc::new(MemoryStore {
        page_size: 100,
        fail_part: Some(2),
        ..Default::default()
    });
    let dir = tempdir().unwrap();
    let archive = write_archive(dir.path(), 250);

    let result = session(store.clone())
        .save(&CacheSaveRequest::new("build-42", paths(), &archive))
        .await;

    match result {
        Err(Error::RetriesExhausted { operation, .. }) => assert_eq!(operation, "uploadPart"),
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(*store.aborted.lock().unwrap(), vec!["upload-0".to_string()]);
    assert_eq!(store.object("build-42"), None);
}

#[tokio::test]
async fn test_restore_downloads_by_key() {
    let store = Arc::new(MemoryStore::with_page_size(100));
    store.put("build-41", archive_bytes(64), 2);
    let dir = tempdir().unwrap();
    let target = dir.path().join("restored.tzst");
    let session = session(store);

    let request = CacheRestoreRequest::new("build-42", paths(), &target)
        .with_restore_keys(vec!["build-".to_string()]);
    let result = session.restore(&request).await.expect("restore failed");

    assert_eq!(result.matched_key.as_deref(), Some("build-41"));
    assert!(!result.exact_match);
    assert_eq!(std::fs::read(&target).unwrap(), archive_bytes(64));
    assert_eq!(session.stats().total_bytes_downloaded, 64);
}

#[tokio::test]
async fn test_download_missing_object_is_fatal() {
    let store = Arc::new(MemoryStore::with_page_size(100));
    let backend = ObjectStoreBackend::new(store, RetryExecutor::new(fast_retry()));
    let dir = tempdir().unwrap();

    let entry = oxide_core::CacheEntry::new("gone", "gone");
    let result = backend.download(&entry, &dir.path().join("out")).await;
    assert!(matches!(result, Err(Error::Service { status: 404, .. })));
}
