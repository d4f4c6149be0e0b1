use std::sync::Arc;
use std::sync::atomic::Ordering;

use bucketview_core::{ObjectStorage, StorageError};
use tokio_util::sync::CancellationToken;

use crate::notify::ErrorSource;

use super::engine::{Browser, BrowserError};
use super::object::BrowserObject;
use super::paths::{DELIMITER, join_key, top_level_dir};
use super::state::{FailureReason, UploadStatus, UploadingObject};
use super::transfer::{PartUploader, TransferError, UploadBody};
use super::traverse::{PendingFile, UploadSource, traverse};

const QUOTA_CODES: &[&str] = &[
    "QuotaExceeded",
    "EntityTooLarge",
    "TooManyParts",
    "StorageLimitExceeded",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Upload even when names collide with listed entries.
    pub ignore_duplicates: bool,
    /// Remember the key of a lone first upload into the bucket root.
    pub first_upload_follow_up: bool,
}

/// Names in `pending` that collide with `listed` rows: a top-level directory
/// against folder rows, a plain file against file rows. Stops after
/// `max_hits` names or `scan_limit` inspected candidates.
pub fn find_duplicates(
    listed: &[BrowserObject],
    pending: &[PendingFile],
    max_hits: usize,
    scan_limit: usize,
) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for candidate in pending.iter().take(scan_limit) {
        if names.len() >= max_hits {
            break;
        }
        let (name, is_dir) = match top_level_dir(&candidate.relative_path) {
            Some(dir) => (dir.to_string(), true),
            None => (candidate.relative_key(), false),
        };
        if names.contains(&name) {
            continue;
        }
        if listed
            .iter()
            .any(|row| row.key == name && row.is_folder() == is_dir)
        {
            names.push(name);
        }
    }
    names
}

impl Browser {
    /// Enqueues every file of `source` under the current path and returns the
    /// keys whose transfers started. Collisions abort the whole batch before
    /// anything is sent unless `ignore_duplicates` is set.
    pub async fn upload(
        &self,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<Vec<String>, BrowserError> {
        match self.start_upload(source, options).await {
            Err(err @ BrowserError::DuplicateUpload { .. }) => Err(err),
            result => self.report(ErrorSource::Upload, result),
        }
    }

    async fn start_upload(
        &self,
        source: UploadSource,
        options: UploadOptions,
    ) -> Result<Vec<String>, BrowserError> {
        let storage = self.storage()?;
        let pending = collect_pending(source).await?;
        let config = &self.inner.config;
        if !options.ignore_duplicates {
            let names = self.with_state(|state| {
                find_duplicates(
                    &state.files,
                    &pending,
                    config.max_duplicates,
                    config.duplicate_scan_limit,
                )
            });
            if !names.is_empty() {
                tracing::debug!(?names, "upload batch rejected");
                return Err(BrowserError::DuplicateUpload { names });
            }
        }

        let (path, bucket) = self.with_state(|state| (state.path.clone(), state.bucket.clone()));
        let follow_up = options.first_upload_follow_up
            && path.is_empty()
            && pending.len() == 1
            && pending[0].relative_path.is_empty();

        let mut started = Vec::new();
        for file in pending {
            let key = join_key(&path, &file.relative_path, &file.item.name);
            if let Some(key) = self.enqueue(&storage, &path, &bucket, key, file, follow_up)? {
                started.push(key);
            }
        }
        Ok(started)
    }

    fn enqueue(
        &self,
        storage: &Arc<dyn ObjectStorage>,
        path: &str,
        bucket: &str,
        key: String,
        file: PendingFile,
        follow_up: bool,
    ) -> Result<Option<String>, BrowserError> {
        let config = &self.inner.config;
        let size = file.item.size;
        let too_big = size > config.max_object_size;
        let cancel = CancellationToken::new();
        let id = self.inner.upload_ids.fetch_add(1, Ordering::Relaxed);

        let accepted = self.with_state(|state| {
            if let Some(existing) = state.upload(&key)
                && !existing.status.is_terminal()
            {
                return false;
            }
            state.uploading.retain(|upload| upload.key != key);
            state.uploading.push(UploadingObject {
                key: key.clone(),
                id,
                bucket: bucket.to_string(),
                path: path.to_string(),
                size,
                status: if too_big {
                    UploadStatus::Failed
                } else {
                    UploadStatus::Queued
                },
                progress: 0,
                failure: too_big.then_some(FailureReason::TooBig),
                cancel: cancel.clone(),
            });
            true
        });
        if !accepted {
            self.inner
                .notifier
                .warning(ErrorSource::Upload, &format!("{key} is already uploading"));
            return Ok(None);
        }
        if too_big {
            tracing::warn!(%key, size, limit = config.max_object_size, "upload rejected");
            self.inner.notifier.error(
                ErrorSource::Upload,
                &format!("{key}: {}", FailureReason::TooBig),
            );
            return Ok(None);
        }

        let uploader = PartUploader::new(storage.clone(), config.part_size, config.part_concurrency);
        let browser = self.clone();
        let transfer_key = key.clone();
        let body = file.item.body;
        let transfer = tokio::spawn(async move {
            browser
                .run_transfer(uploader, transfer_key, id, body, size, cancel)
                .await
        });

        let browser = self.clone();
        let step_key = key.clone();
        self.chain()
            .push(Box::pin(async move {
                let outcome = match transfer.await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(TransferError::Task(err.to_string())),
                };
                browser
                    .complete_upload(&step_key, id, outcome, follow_up)
                    .await;
            }))
            .map_err(|_| BrowserError::ChainClosed)?;
        tracing::debug!(%key, id, size, "upload queued");
        Ok(Some(key))
    }

    async fn run_transfer(
        &self,
        uploader: PartUploader,
        key: String,
        id: u64,
        body: UploadBody,
        size: u64,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let started = self.with_state(|state| match state.attempt_mut(&key, id) {
            Some(entry) if entry.status == UploadStatus::Queued => {
                entry.status = UploadStatus::InProgress;
                true
            }
            _ => false,
        });
        if !started {
            return Err(TransferError::Cancelled);
        }
        let on_progress = |percent: u8| {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.record_progress(&key, id, percent) {
                self.inner
                    .notifier
                    .error(ErrorSource::Upload, &err.to_string());
            }
        };
        uploader
            .upload(&key, &body, size, &cancel, &on_progress)
            .await
    }

    /// Routes a progress event to the in-progress entry of attempt `id` for
    /// `key`. An event without such an entry means the upload was dropped
    /// from state while its transfer kept running.
    pub fn record_progress(&self, key: &str, id: u64, percent: u8) -> Result<(), BrowserError> {
        let tracked = self.with_state(|state| match state.attempt_mut(key, id) {
            Some(entry) if entry.status == UploadStatus::InProgress => {
                entry.progress = percent.min(100);
                true
            }
            _ => false,
        });
        if !tracked {
            return Err(BrowserError::MissingEntry(key.to_string()));
        }
        self.inner.notifier.progress(key, percent);
        Ok(())
    }

    /// One link of the completion chain: settle the entry, refresh the
    /// listing, then check for the first-upload follow-up. A step whose
    /// entry was replaced by a newer attempt settles nothing.
    async fn complete_upload(
        &self,
        key: &str,
        id: u64,
        outcome: Result<(), TransferError>,
        follow_up: bool,
    ) {
        let failure = outcome.as_ref().err().map(failure_reason);
        let settled = self.with_state(|state| {
            let entry = state.attempt_mut(key, id)?;
            if entry.status == UploadStatus::Cancelled {
                return None;
            }
            match &failure {
                None => {
                    entry.status = UploadStatus::Finished;
                    entry.progress = 100;
                }
                Some(reason) => {
                    entry.status = UploadStatus::Failed;
                    entry.failure = Some(reason.clone());
                }
            }
            Some(())
        });
        if settled.is_none() {
            tracing::debug!(key, id, "upload cancelled or replaced, skipping completion");
            return;
        }

        match (&outcome, &failure) {
            (Err(err), Some(FailureReason::Generic)) => {
                tracing::warn!(key, error = %err, "upload failed");
                self.inner
                    .notifier
                    .error(ErrorSource::Upload, &format!("{key}: {err}"));
            }
            (Err(err), Some(reason)) => {
                tracing::warn!(key, error = %err, "upload rejected by backend");
                self.inner
                    .notifier
                    .error(ErrorSource::Upload, &format!("{key}: {reason}"));
            }
            _ => tracing::debug!(key, "upload finished"),
        }

        if let Err(err) = self.refresh_current().await {
            self.inner
                .notifier
                .error(ErrorSource::Listing, &err.to_string());
        }

        if follow_up && outcome.is_ok() && !key.contains(DELIMITER) {
            self.with_state(|state| {
                let files = state.files.iter().filter(|row| !row.is_folder()).count();
                if files == 1 {
                    state.first_uploaded_key = Some(key.to_string());
                }
            });
        }
    }

    /// Flips a running upload to cancelled and aborts its transfer. The
    /// abort error that follows is swallowed by the completion step.
    pub fn cancel_upload(&self, key: &str) -> Result<(), BrowserError> {
        let cancelled = self.with_state(|state| match state.upload_mut(key) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.status = UploadStatus::Cancelled;
                entry.cancel.cancel();
                true
            }
            _ => false,
        });
        if cancelled {
            tracing::debug!(key, "upload cancelled");
            Ok(())
        } else {
            self.report(
                ErrorSource::Upload,
                Err(BrowserError::MissingEntry(key.to_string())),
            )
        }
    }

    pub(super) fn cancel_all_uploads(&self) {
        self.with_state(|state| {
            for entry in state
                .uploading
                .iter_mut()
                .filter(|entry| !entry.status.is_terminal())
            {
                entry.status = UploadStatus::Cancelled;
                entry.cancel.cancel();
            }
        });
    }

    /// Drops finished, failed and cancelled entries from the upload panel.
    pub fn clear_uploads(&self) {
        self.with_state(|state| {
            state
                .uploading
                .retain(|entry| !entry.status.is_terminal())
        });
    }

    /// Resolves once every completion step queued so far has run.
    pub async fn wait_for_uploads(&self) -> Result<(), BrowserError> {
        self.chain()
            .flush()
            .await
            .map_err(|_| BrowserError::ChainClosed)
    }

    pub fn take_first_uploaded_key(&self) -> Option<String> {
        self.with_state(|state| state.first_uploaded_key.take())
    }
}

async fn collect_pending(source: UploadSource) -> Result<Vec<PendingFile>, BrowserError> {
    if source.is_blocking() {
        let files = tokio::task::spawn_blocking(move || {
            traverse(source).collect::<Result<Vec<_>, _>>()
        })
        .await??;
        return Ok(files);
    }
    Ok(traverse(source).collect::<Result<Vec<_>, _>>()?)
}

fn failure_reason(err: &TransferError) -> FailureReason {
    match err {
        TransferError::Storage(StorageError::Service { code, message, .. })
            if is_quota_error(code.as_deref(), message) =>
        {
            FailureReason::Backend(message.clone())
        }
        _ => FailureReason::Generic,
    }
}

fn is_quota_error(code: Option<&str>, message: &str) -> bool {
    if code.is_some_and(|code| QUOTA_CODES.contains(&code)) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    message.contains("quota") || message.contains("limit exceeded")
}
