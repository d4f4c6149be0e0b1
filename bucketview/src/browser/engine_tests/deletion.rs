use std::time::Duration;

use bucketview_core::MemoryStorage;

use super::{harness, keys, row};
use crate::browser::engine::BrowserError;
use crate::browser::traverse::{FileItem, UploadSource};
use crate::browser::upload::UploadOptions;
use crate::config::BrowserConfig;
use crate::notify::ErrorSource;

#[tokio::test]
async fn folder_delete_survives_a_failing_key() {
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(10));
    for i in 0..10 {
        storage.insert(format!("f/{i}"), "x");
    }
    storage.fail_deletes_for("f/3");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();

    let folder = row(&h.browser, "f");
    let err = h.browser.delete_folder(&folder, false).await.unwrap_err();
    let failures = match err {
        BrowserError::Deletion { failures } => failures,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "f/3");
    assert_eq!(failures[0].error.code(), Some("AccessDenied"));

    let stats = h.storage.stats();
    assert_eq!(stats.delete_object, 10);
    assert_eq!(stats.peak_deletes_in_flight, 3);
    assert_eq!(h.storage.keys(), vec!["f/3"]);
    assert_eq!(
        h.notifier.errors_from(ErrorSource::Deletion),
        vec!["1 delete(s) failed"]
    );
    // The survivor keeps the folder listed.
    assert_eq!(keys(&h.browser.snapshot().files), vec!["f"]);
}

#[tokio::test]
async fn nested_folders_are_purged_level_by_level() {
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(1));
    for key in [
        "top/",
        "top/a",
        "top/sub/",
        "top/sub/b",
        "top/sub/deeper/c",
        "keep.txt",
    ] {
        storage.insert(key, "x");
    }
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();

    h.browser
        .delete_folder(&row(&h.browser, "top"), false)
        .await
        .unwrap();

    assert_eq!(h.storage.keys(), vec!["keep.txt"]);
    let stats = h.storage.stats();
    assert_eq!(stats.delete_object, 5);
    assert!(stats.peak_deletes_in_flight <= 3);
    assert_eq!(keys(&h.browser.snapshot().files), vec!["keep.txt"]);
    assert!(h.notifier.errors().is_empty());
}

#[tokio::test]
async fn version_purge_leaves_no_history() {
    let storage = MemoryStorage::versioned("bucket");
    storage.insert("v/doc.txt", "1");
    storage.insert("v/doc.txt", "2");
    storage.insert_delete_marker("v/doc.txt");
    storage.insert("v/sub/x", "x");
    let h = harness(storage, BrowserConfig::default());
    h.browser.set_show_versions(true).await.unwrap();

    h.browser
        .delete_folder(&row(&h.browser, "v"), true)
        .await
        .unwrap();

    assert_eq!(h.storage.version_count("v/doc.txt"), 0);
    assert_eq!(h.storage.version_count("v/sub/x"), 0);
    assert_eq!(h.storage.stats().delete_object, 4);
    assert!(h.browser.snapshot().files.is_empty());
}

#[tokio::test]
async fn plain_folder_delete_leaves_markers_on_versioned_buckets() {
    let storage = MemoryStorage::versioned("bucket");
    storage.insert("v/a", "a");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();

    h.browser
        .delete_folder(&row(&h.browser, "v"), false)
        .await
        .unwrap();

    assert!(h.storage.keys().is_empty());
    assert_eq!(h.storage.version_count("v/a"), 2);
}

#[tokio::test]
async fn deleting_a_file_drops_its_upload_entry() {
    let h = harness(MemoryStorage::new("bucket"), BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    h.browser
        .upload(
            UploadSource::File(FileItem::from_bytes("a.txt", "a")),
            UploadOptions::default(),
        )
        .await
        .unwrap();
    h.browser.wait_for_uploads().await.unwrap();
    assert!(h.browser.snapshot().upload("a.txt").is_some());

    h.browser
        .delete_object(&row(&h.browser, "a.txt"), true)
        .await
        .unwrap();

    let state = h.browser.snapshot();
    assert!(state.upload("a.txt").is_none());
    assert!(state.files.is_empty());
    assert!(state.pending_deletions.is_empty());
    assert!(h.storage.keys().is_empty());
}

#[tokio::test]
async fn concurrent_deletes_of_one_row_hit_storage_once() {
    let storage = MemoryStorage::new("bucket").with_latency(Duration::from_millis(20));
    storage.insert("a.txt", "a");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    let target = row(&h.browser, "a.txt");

    let (first, second) = tokio::join!(
        h.browser.delete_object(&target, false),
        h.browser.delete_object(&target, false)
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(h.storage.stats().delete_object, 1);
    assert!(h.browser.snapshot().pending_deletions.is_empty());
}

#[tokio::test]
async fn selection_delete_skips_the_refresh() {
    let storage = MemoryStorage::new("bucket");
    for key in ["a.txt", "b.txt", "dir/x", "dir/y"] {
        storage.insert(key, "x");
    }
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    h.browser.wait_for_count().await;
    h.browser.toggle_selected(&row(&h.browser, "a.txt"));
    h.browser.toggle_selected(&row(&h.browser, "dir"));
    let listed = h.storage.stats().list_objects;

    h.browser.delete_selected(false).await.unwrap();

    assert_eq!(h.storage.keys(), vec!["b.txt"]);
    // One level listing for the folder, no re-list of the page.
    assert_eq!(h.storage.stats().list_objects, listed + 1);
    let state = h.browser.snapshot();
    assert_eq!(keys(&state.files), vec!["b.txt"]);
    assert!(state.selected.is_empty());
    assert!(state.pending_deletions.is_empty());
}

#[tokio::test]
async fn selection_delete_aggregates_failures() {
    let storage = MemoryStorage::new("bucket");
    for key in ["a.txt", "dir/x", "dir/y"] {
        storage.insert(key, "x");
    }
    storage.fail_deletes_for("dir/y");
    let h = harness(storage, BrowserConfig::default());
    h.browser.init_list("").await.unwrap();
    h.browser.set_selected(vec![row(&h.browser, "a.txt"), row(&h.browser, "dir")]);

    let err = h.browser.delete_selected(false).await.unwrap_err();
    let failures = match err {
        BrowserError::Deletion { failures } => failures,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].to_string(),
        "dir/y: DeleteObject failed: Access Denied"
    );
    assert_eq!(h.storage.keys(), vec!["dir/y"]);
    let state = h.browser.snapshot();
    assert_eq!(keys(&state.files), vec!["dir"]);
    assert_eq!(keys(&state.selected), vec!["dir"]);
}
