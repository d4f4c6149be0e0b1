use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bucketview_core::{ListObjectsRequest, ListVersionsRequest, ObjectStorage, StorageError};
use futures_util::future::join_all;

use crate::notify::ErrorSource;

use super::engine::{Browser, BrowserError, lock};
use super::object::BrowserObject;
use super::paths::DELIMITER;

/// One key (or key version) that could not be removed.
#[derive(Debug)]
pub struct DeleteFailure {
    pub key: String,
    pub version_id: Option<String>,
    pub error: StorageError,
}

impl fmt::Display for DeleteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_id {
            Some(version_id) => write!(f, "{} ({version_id}): {}", self.key, self.error),
            None => write!(f, "{}: {}", self.key, self.error),
        }
    }
}

#[derive(Debug, Clone)]
struct DeleteTarget {
    key: String,
    version_id: Option<String>,
}

type Level = (Vec<DeleteTarget>, Vec<String>);

impl Browser {
    /// Deletes one row. A file row removes exactly its key (or its version
    /// when the row carries one); a folder row removes the whole prefix.
    pub async fn delete_object(
        &self,
        object: &BrowserObject,
        refresh: bool,
    ) -> Result<(), BrowserError> {
        let result = if object.is_folder() {
            self.purge_folder(object, false, refresh).await
        } else if self.mark_pending(object) {
            self.remove_file(object, refresh).await
        } else {
            tracing::debug!(key = %object.full_key(), "delete already pending");
            Ok(())
        };
        self.report(ErrorSource::Deletion, result)
    }

    /// Recursively deletes everything under `folder`, or every version and
    /// delete marker under it with `with_versions`. Refreshes the listing
    /// once at the end.
    pub async fn delete_folder(
        &self,
        folder: &BrowserObject,
        with_versions: bool,
    ) -> Result<(), BrowserError> {
        let result = self.purge_folder(folder, with_versions, true).await;
        self.report(ErrorSource::Deletion, result)
    }

    /// Deletes every selected row concurrently without refreshing; the
    /// caller decides when to re-list.
    pub async fn delete_selected(&self, with_versions: bool) -> Result<(), BrowserError> {
        let result = async {
            self.storage()?;
            let selected = self.with_state(|state| state.selected.clone());
            let targets: Vec<BrowserObject> = selected
                .into_iter()
                .filter(|object| object.is_folder() || self.mark_pending(object))
                .collect();
            let outcomes = join_all(targets.iter().map(|object| async move {
                if object.is_folder() {
                    self.purge_folder(object, with_versions, false).await
                } else {
                    self.remove_file(object, false).await
                }
            }))
            .await;

            let mut failures = Vec::new();
            for (object, outcome) in targets.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {}
                    Err(BrowserError::Deletion { failures: nested }) => failures.extend(nested),
                    Err(BrowserError::Storage(error)) => failures.push(DeleteFailure {
                        key: object.full_key(),
                        version_id: object.version_id.clone(),
                        error,
                    }),
                    Err(other) => return Err(other),
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(BrowserError::Deletion { failures })
            }
        }
        .await;
        self.report(ErrorSource::Deletion, result)
    }

    /// Returns false when the row is already being deleted.
    fn mark_pending(&self, object: &BrowserObject) -> bool {
        let id = object.composite_id();
        self.with_state(|state| state.pending_deletions.insert(id))
    }

    async fn remove_file(&self, object: &BrowserObject, refresh: bool) -> Result<(), BrowserError> {
        let key = object.full_key();
        let deleted = async {
            let storage = self.storage()?;
            storage
                .delete_object(&key, object.version_id.as_deref())
                .await?;
            Ok::<_, BrowserError>(())
        }
        .await;
        if deleted.is_ok() {
            tracing::debug!(%key, version_id = object.version_id.as_deref(), "object deleted");
            self.with_state(|state| state.uploading.retain(|upload| upload.key != key));
        }
        let refreshed = match (&deleted, refresh) {
            (Ok(()), true) => self.refresh_current().await,
            _ => Ok(()),
        };
        self.with_state(|state| {
            state.pending_deletions.remove(&object.composite_id());
            if deleted.is_ok() {
                state.remove_file(object);
            }
        });
        deleted.and(refreshed)
    }

    async fn purge_folder(
        &self,
        folder: &BrowserObject,
        with_versions: bool,
        refresh: bool,
    ) -> Result<(), BrowserError> {
        let storage = self.storage()?;
        let prefix = folder.folder_prefix();
        let failures = self
            .purge_prefix(storage.as_ref(), prefix.clone(), with_versions)
            .await;
        if failures.is_empty() {
            tracing::debug!(%prefix, with_versions, "folder deleted");
            self.with_state(|state| state.remove_file(folder));
        } else {
            tracing::warn!(%prefix, failed = failures.len(), "folder partially deleted");
        }
        let refreshed = if refresh {
            self.refresh_current().await
        } else {
            Ok(())
        };
        if !failures.is_empty() {
            return Err(BrowserError::Deletion { failures });
        }
        refreshed
    }

    /// Walks `root` level by level. Each level is listed completely and
    /// drained by the worker pool before its sub-prefixes are visited, one
    /// after another. A failing key or level does not stop the rest.
    async fn purge_prefix(
        &self,
        storage: &dyn ObjectStorage,
        root: String,
        with_versions: bool,
    ) -> Vec<DeleteFailure> {
        let workers = self.inner.config.delete_workers;
        let mut levels = vec![root];
        let mut failures = Vec::new();
        while let Some(prefix) = levels.pop() {
            let level = if with_versions {
                list_version_level(storage, &prefix).await
            } else {
                list_object_level(storage, &prefix).await
            };
            let (targets, children) = match level {
                Ok(level) => level,
                Err(error) => {
                    tracing::warn!(%prefix, error = %error, "listing level for delete failed");
                    failures.push(DeleteFailure {
                        key: prefix,
                        version_id: None,
                        error,
                    });
                    continue;
                }
            };
            tracing::debug!(
                %prefix,
                keys = targets.len(),
                children = children.len(),
                "draining level"
            );
            failures.extend(drain_level(storage, targets, workers).await);
            levels.extend(children.into_iter().rev());
        }
        failures
    }
}

async fn list_object_level(storage: &dyn ObjectStorage, prefix: &str) -> Result<Level, StorageError> {
    let mut targets = Vec::new();
    let mut children = Vec::new();
    let mut token = None;
    loop {
        let listing = storage
            .list_objects(ListObjectsRequest {
                prefix: prefix.to_string(),
                delimiter: Some(DELIMITER.to_string()),
                continuation_token: token.take(),
                max_keys: None,
            })
            .await?;
        targets.extend(listing.objects.into_iter().map(|object| DeleteTarget {
            key: object.key,
            version_id: None,
        }));
        children.extend(listing.common_prefixes);
        match listing.next_continuation_token {
            Some(next) if listing.is_truncated => token = Some(next),
            _ => break,
        }
    }
    Ok((targets, children))
}

async fn list_version_level(storage: &dyn ObjectStorage, prefix: &str) -> Result<Level, StorageError> {
    let mut targets = Vec::new();
    let mut children = Vec::new();
    let mut key_marker = None;
    let mut version_id_marker = None;
    loop {
        let listing = storage
            .list_object_versions(ListVersionsRequest {
                prefix: prefix.to_string(),
                delimiter: Some(DELIMITER.to_string()),
                key_marker: key_marker.take(),
                version_id_marker: version_id_marker.take(),
                max_keys: None,
            })
            .await?;
        targets.extend(listing.versions.into_iter().map(|version| DeleteTarget {
            key: version.key,
            version_id: version.version_id,
        }));
        children.extend(listing.common_prefixes);
        if !listing.is_truncated
            || (listing.next_key_marker.is_none() && listing.next_version_id_marker.is_none())
        {
            break;
        }
        key_marker = listing.next_key_marker;
        version_id_marker = listing.next_version_id_marker;
    }
    Ok((targets, children))
}

/// Runs `workers` deleters over a shared stack of targets. Each worker pops
/// from the top until the stack is empty, so at most `workers` deletes are
/// in flight.
async fn drain_level(
    storage: &dyn ObjectStorage,
    targets: Vec<DeleteTarget>,
    workers: usize,
) -> Vec<DeleteFailure> {
    if targets.is_empty() {
        return Vec::new();
    }
    let remaining = AtomicUsize::new(targets.len());
    let failures = Mutex::new(Vec::new());
    let workers = workers.max(1).min(targets.len());
    join_all((0..workers).map(|_| delete_worker(storage, &targets, &remaining, &failures))).await;
    failures
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn delete_worker(
    storage: &dyn ObjectStorage,
    targets: &[DeleteTarget],
    remaining: &AtomicUsize,
    failures: &Mutex<Vec<DeleteFailure>>,
) {
    while let Ok(left) =
        remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
    {
        let target = &targets[left - 1];
        if let Err(error) = storage
            .delete_object(&target.key, target.version_id.as_deref())
            .await
        {
            tracing::warn!(key = %target.key, error = %error, "delete failed");
            lock(failures).push(DeleteFailure {
                key: target.key.clone(),
                version_id: target.version_id.clone(),
                error,
            });
        }
    }
}
