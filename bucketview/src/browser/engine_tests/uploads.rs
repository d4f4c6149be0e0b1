use std::time::Duration;

use bucketview_core::MemoryStorage;
use tempfile::tempdir;

use super::{harness, keys};
use crate::browser::engine::BrowserError;
use crate::browser::state::{FailureReason, UploadStatus};
use crate::browser::traverse::{DirEntry, FileItem, UploadSource};
use crate::browser::upload::UploadOptions;
use crate::config::BrowserConfig;
use crate::notify::ErrorSource;

fn file(name: &str, body: &'static str) -> UploadSource {
    UploadSource::File(FileItem::from_bytes(name.to_string(), body))
}

fn ignoring_duplicates() -> UploadOptions {
    UploadOptions {
        ignore_duplicates: true,
        ..UploadOptions::default()
    }
}

#[tokio::test]
async fn upload_lands_in_storage_and_listing() {
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());
    h.browser.init_list("").await.unwrap();

    let started = h
        .browser
        .upload(file("hello.txt", "hello world"), UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(started, vec!["hello.txt"]);
    h.browser.wait_for_uploads().await.unwrap();

    assert_eq!(h.storage.object("hello.txt").unwrap(), "hello world");
    let state = h.browser.snapshot();
    assert_eq!(keys(&state.files), vec!["hello.txt"]);
    assert_eq!(state.files[0].size, 11);
    let entry = state.upload("hello.txt").unwrap();
    assert_eq!(entry.status, UploadStatus::Finished);
    assert_eq!(entry.progress, 100);
    assert_eq!(h.notifier.progress(), vec![("hello.txt".to_string(), 100)]);
    assert!(h.notifier.errors().is_empty());
}

#[tokio::test]
async fn uploads_go_under_the_current_path() {
    let storage = MemoryStorage::new("bucket");
    storage.insert("docs/", "");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("docs/").await.unwrap();

    let source = UploadSource::Directory {
        name: "2024".into(),
        entries: vec![
            DirEntry::File(FileItem::from_bytes("a.txt", "a")),
            DirEntry::Dir {
                name: "q1".into(),
                entries: vec![DirEntry::File(FileItem::from_bytes("b.txt", "b"))],
            },
        ],
    };
    let started = h
        .browser
        .upload(source, UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(started, vec!["docs/2024/a.txt", "docs/2024/q1/b.txt"]);
    h.browser.wait_for_uploads().await.unwrap();

    assert!(h.storage.object("docs/2024/q1/b.txt").is_some());
    assert_eq!(keys(&h.browser.snapshot().files), vec!["2024"]);
}

#[tokio::test]
async fn size_limit_is_inclusive() {
    let config = BrowserConfig {
        max_object_size: 8,
        ..BrowserConfig::default()
    };
    let h = harness(MemoryStorage::new("bucket"), config);
    let source = UploadSource::Files(vec![
        FileItem::from_bytes("exact.bin", "12345678"),
        FileItem::from_bytes("over.bin", "123456789"),
    ]);

    let started = h
        .browser
        .upload(source, UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(started, vec!["exact.bin"]);
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    assert_eq!(state.upload("exact.bin").unwrap().status, UploadStatus::Finished);
    let over = state.upload("over.bin").unwrap();
    assert_eq!(over.status, UploadStatus::Failed);
    assert_eq!(over.failure, Some(FailureReason::TooBig));
    assert!(h.storage.object("over.bin").is_none());
    assert_eq!(h.storage.stats().put_object, 1);
    assert_eq!(
        h.notifier.errors_from(ErrorSource::Upload),
        vec!["over.bin: File is too big to upload"]
    );
}

#[tokio::test]
async fn large_bodies_go_multipart_with_bounded_parts() {
    let config = BrowserConfig {
        part_size: 4,
        part_concurrency: 4,
        ..BrowserConfig::default()
    };
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(10));
    let h = harness(storage, config);
    let body: &'static str = "0123456789abcdefghijklmnopqrstuvwxyzABCD";

    h.browser
        .upload(file("big.bin", body), UploadOptions::default())
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();

    assert_eq!(h.storage.object("big.bin").unwrap(), body);
    let stats = h.storage.stats();
    assert_eq!(stats.create_multipart, 1);
    assert_eq!(stats.upload_part, 10);
    assert_eq!(stats.complete_multipart, 1);
    assert_eq!(stats.peak_parts_in_flight, 4);
    assert_eq!(h.storage.open_uploads(), 0);

    let progress: Vec<u8> = h.notifier.progress().into_iter().map(|(_, p)| p).collect();
    assert_eq!(progress.len(), 10);
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn colliding_batch_is_rejected_before_any_transfer() {
    let storage = MemoryStorage::new("bucket");
    for i in 0..5 {
        storage.insert(format!("f{i}.txt"), "old");
    }
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    let batch = || {
        UploadSource::Files(
            (0..6)
                .map(|i| FileItem::from_bytes(format!("f{i}.txt"), "new"))
                .collect(),
        )
    };

    for _ in 0..2 {
        let err = h
            .browser
            .upload(batch(), UploadOptions::default())
            .await
            .unwrap_err();
        match err {
            BrowserError::DuplicateUpload { names } => assert_eq!(
                names,
                vec!["f0.txt", "f1.txt", "f2.txt", "f3.txt", "f4.txt"]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(h.storage.stats().transport_writes(), 0);
    assert!(h.browser.snapshot().uploading.is_empty());
    assert!(h.notifier.errors().is_empty());

    h.browser
        .upload(batch(), ignoring_duplicates())
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();
    assert_eq!(h.storage.object("f0.txt").unwrap(), "new");
    assert_eq!(h.storage.keys().len(), 6);
}

#[tokio::test]
async fn dropped_directory_collides_with_folder() {
    let storage = MemoryStorage::new("bucket");
    storage.insert("photos/old.jpg", "x");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();

    let source = UploadSource::Directory {
        name: "photos".into(),
        entries: vec![DirEntry::File(FileItem::from_bytes("new.jpg", "y"))],
    };
    let err = h
        .browser
        .upload(source, UploadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrowserError::DuplicateUpload { names } if names == vec!["photos"]));
}

#[tokio::test]
async fn second_upload_of_a_running_key_is_skipped() {
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(50));
    let h = harness(storage, BrowserConfig::default());

    h.browser
        .upload(file("a.txt", "first"), ignoring_duplicates())
        .await
        .unwrap();
    let started = h
        .browser
        .upload(file("a.txt", "second"), ignoring_duplicates())
        .await
        .unwrap();
    assert!(started.is_empty());
    assert_eq!(
        h.notifier.warnings(),
        vec![(ErrorSource::Upload, "a.txt is already uploading".to_string())]
    );

    h.browser.wait_for_uploads().await.unwrap();
    assert_eq!(h.storage.object("a.txt").unwrap(), "first");

    // A settled entry is replaced by a new attempt.
    h.browser
        .upload(file("a.txt", "third"), ignoring_duplicates())
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();
    let state = h.browser.snapshot();
    assert_eq!(state.uploading.len(), 1);
    assert_eq!(h.storage.object("a.txt").unwrap(), "third");
}

#[tokio::test]
async fn cancel_before_start_never_transfers() {
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());

    h.browser
        .upload(file("a.txt", "abc"), UploadOptions::default())
        .await
        .unwrap();
    h.browser.cancel_upload("a.txt").unwrap();
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    assert_eq!(state.upload("a.txt").unwrap().status, UploadStatus::Cancelled);
    assert_eq!(h.storage.stats().transport_writes(), 0);
    assert!(h.notifier.errors().is_empty());
}

#[tokio::test]
async fn cancel_mid_transfer_aborts_multipart() {
    let config = BrowserConfig {
        part_size: 2,
        part_concurrency: 1,
        ..BrowserConfig::default()
    };
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(50));
    let h = harness(storage, config);

    h.browser
        .upload(file("big.bin", "0123456789"), UploadOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.browser.cancel_upload("big.bin").unwrap();
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    assert_eq!(state.upload("big.bin").unwrap().status, UploadStatus::Cancelled);
    let stats = h.storage.stats();
    assert_eq!(stats.abort_multipart, 1);
    assert_eq!(stats.complete_multipart, 0);
    assert_eq!(h.storage.open_uploads(), 0);
    assert!(h.storage.object("big.bin").is_none());
    assert!(h.notifier.errors().is_empty());
}

#[tokio::test]
async fn cancelled_key_can_be_uploaded_again() {
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(20));
    let h = harness(storage, BrowserConfig::default());

    h.browser
        .upload(file("a.txt", "first"), UploadOptions::default())
        .await
        .unwrap();
    h.browser.cancel_upload("a.txt").unwrap();
    let started = h
        .browser
        .upload(file("a.txt", "second"), UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(started, vec!["a.txt"]);
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    assert_eq!(state.uploading.len(), 1);
    let entry = state.upload("a.txt").unwrap();
    assert_eq!(entry.status, UploadStatus::Finished);
    assert_eq!(entry.failure, None);
    assert_eq!(h.storage.object("a.txt").unwrap(), "second");
    assert!(h.notifier.errors().is_empty());
}

#[tokio::test]
async fn stale_multipart_does_not_touch_its_replacement() {
    let config = BrowserConfig {
        part_size: 2,
        part_concurrency: 1,
        ..BrowserConfig::default()
    };
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(50));
    let h = harness(storage, config);

    h.browser
        .upload(file("big.bin", "0123456789"), UploadOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.browser.cancel_upload("big.bin").unwrap();
    h.browser
        .upload(file("big.bin", "abcdefghij"), UploadOptions::default())
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    let entry = state.upload("big.bin").unwrap();
    assert_eq!(entry.status, UploadStatus::Finished);
    assert_eq!(entry.failure, None);
    assert_eq!(entry.progress, 100);
    assert_eq!(h.storage.object("big.bin").unwrap(), "abcdefghij");
    let stats = h.storage.stats();
    assert_eq!(stats.abort_multipart, 1);
    assert_eq!(stats.complete_multipart, 1);
    assert_eq!(h.storage.open_uploads(), 0);
    assert!(h.notifier.errors().is_empty());
}

#[tokio::test]
async fn transport_failure_fails_only_its_upload() {
    let storage = MemoryStorage::new("bucket");
    storage.fail_puts_for("b.txt");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    let source = UploadSource::Files(vec![
        FileItem::from_bytes("a.txt", "a"),
        FileItem::from_bytes("b.txt", "b"),
        FileItem::from_bytes("c.txt", "c"),
    ]);

    let started = h
        .browser
        .upload(source, UploadOptions::default())
        .await
        .unwrap();
    assert_eq!(started.len(), 3);
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    let failed = state.upload("b.txt").unwrap();
    assert_eq!(failed.status, UploadStatus::Failed);
    assert_eq!(failed.failure, Some(FailureReason::Generic));
    for key in ["a.txt", "c.txt"] {
        assert_eq!(state.upload(key).unwrap().status, UploadStatus::Finished);
    }
    assert_eq!(h.storage.keys(), vec!["a.txt", "c.txt"]);
    assert_eq!(keys(&state.files), vec!["a.txt", "c.txt"]);
    assert_eq!(
        h.notifier.errors_from(ErrorSource::Upload),
        vec!["b.txt: storage error: PutObject request failed: connection reset by peer"]
    );
}

#[tokio::test]
async fn cancelling_unknown_upload_is_reported() {
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());
    let err = h.browser.cancel_upload("ghost.txt").unwrap_err();
    assert!(matches!(err, BrowserError::MissingEntry(_)));
    assert_eq!(h.notifier.errors_from(ErrorSource::Upload).len(), 1);
}

#[tokio::test]
async fn progress_without_running_entry_is_an_error() {
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());
    let err = h.browser.record_progress("nope.txt", 1, 10).unwrap_err();
    assert!(matches!(err, BrowserError::MissingEntry(key) if key == "nope.txt"));
    assert!(h.notifier.progress().is_empty());
}

#[tokio::test]
async fn lone_first_upload_is_remembered() {
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    let options = UploadOptions {
        first_upload_follow_up: true,
        ..UploadOptions::default()
    };

    h.browser
        .upload(file("first.txt", "x"), options)
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();
    assert_eq!(h.browser.take_first_uploaded_key().as_deref(), Some("first.txt"));
    assert_eq!(h.browser.take_first_uploaded_key(), None);

    h.browser
        .upload(file("second.txt", "y"), options)
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();
    assert_eq!(h.browser.take_first_uploaded_key(), None);
}

#[tokio::test]
async fn every_completion_settles() {
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(5));
    let h = harness(storage, BrowserConfig::default());
    let source = UploadSource::Files(vec![
        FileItem::from_bytes("a.txt", "a"),
        FileItem::from_bytes("b.txt", "b"),
        FileItem::from_bytes("c.txt", "c"),
    ]);

    h.browser
        .upload(source, UploadOptions::default())
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();

    let state = h.browser.snapshot();
    assert!(
        state
            .uploading
            .iter()
            .all(|entry| entry.status == UploadStatus::Finished)
    );
    assert_eq!(state.uploading.len(), 3);
    assert_eq!(keys(&h.browser.sorted_files()), vec!["a.txt", "b.txt", "c.txt"]);

    h.browser.clear_uploads();
    assert!(h.browser.snapshot().uploading.is_empty());
}

#[tokio::test]
async fn local_directories_upload_with_their_name() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("album");
    std::fs::create_dir_all(root.join("raw")).unwrap();
    std::fs::write(root.join("cover.jpg"), b"cover").unwrap();
    std::fs::write(root.join("raw/one.cr2"), b"raw-bytes").unwrap();
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());

    h.browser
        .upload(UploadSource::Local(root), UploadOptions::default())
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();

    assert_eq!(h.storage.keys(), vec!["album/cover.jpg", "album/raw/one.cr2"]);
    assert_eq!(h.storage.object("album/raw/one.cr2").unwrap(), "raw-bytes");
}
