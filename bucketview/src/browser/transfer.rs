use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bucketview_core::{CompletedPart, ObjectStorage, StorageError};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use md5::Context;
use reqwest::Client;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer task failed: {0}")]
    Task(String),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

/// Where an upload's bytes come from. File bodies are read part by part.
#[derive(Debug, Clone)]
pub enum UploadBody {
    Bytes(Bytes),
    File(PathBuf),
}

impl UploadBody {
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, TransferError> {
        match self {
            UploadBody::Bytes(bytes) => {
                let start = (offset as usize).min(bytes.len());
                let end = (start + len as usize).min(bytes.len());
                Ok(bytes.slice(start..end))
            }
            UploadBody::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Sends one object either as a single put or as a multipart upload with a
/// bounded number of parts in flight.
pub(super) struct PartUploader {
    storage: Arc<dyn ObjectStorage>,
    part_size: u64,
    concurrency: usize,
}

impl PartUploader {
    pub(super) fn new(storage: Arc<dyn ObjectStorage>, part_size: u64, concurrency: usize) -> Self {
        Self {
            storage,
            part_size: part_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub(super) async fn upload(
        &self,
        key: &str,
        body: &UploadBody,
        size: u64,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if size <= self.part_size {
            let bytes = body.read_range(0, size).await?;
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                result = self.storage.put_object(key, bytes) => result?,
            }
            on_progress(100);
            return Ok(());
        }

        let upload_id = self.storage.create_multipart_upload(key).await?;
        tracing::debug!(key, %upload_id, size, "multipart upload started");
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.upload_parts(key, &upload_id, body, size, on_progress) => result,
        };
        let outcome = match result {
            Ok(parts) => self
                .storage
                .complete_multipart_upload(key, &upload_id, parts)
                .await
                .map_err(TransferError::from),
            Err(err) => Err(err),
        };
        if outcome.is_err()
            && let Err(abort) = self.storage.abort_multipart_upload(key, &upload_id).await
        {
            tracing::warn!(key, %upload_id, error = %abort, "abort multipart upload failed");
        }
        outcome
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: &UploadBody,
        size: u64,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<Vec<CompletedPart>, TransferError> {
        let part_size = self.part_size;
        let storage = self.storage.as_ref();
        let sent = AtomicU64::new(0);
        let sent = &sent;
        let part_count = size.div_ceil(part_size);

        let mut parts: Vec<CompletedPart> = stream::iter(0..part_count)
            .map(move |index| async move {
                let offset = index * part_size;
                let len = part_size.min(size - offset);
                let bytes = body.read_range(offset, len).await?;
                let part = storage
                    .upload_part(key, upload_id, index as i32 + 1, bytes)
                    .await?;
                let done = sent.fetch_add(len, Ordering::SeqCst) + len;
                on_progress(percent(done, size));
                Ok::<_, TransferError>(part)
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }
}

pub(super) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100 + total / 2) / total) as u8
}

/// Streams presigned GETs to disk through a `.partial` file.
#[derive(Clone, Default)]
pub struct Downloader {
    http: Client,
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    /// Returns the number of bytes written. `target` only appears once the
    /// body is complete and, with `expected_md5`, matches the digest; the
    /// `.partial` file is removed on any failure.
    pub async fn download(
        &self,
        url: Url,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<u64, TransferError> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        match write_verified(response, &partial, expected_md5).await {
            Ok(written) => {
                tokio::fs::rename(&partial, target).await?;
                Ok(written)
            }
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    tracing::debug!(path = %partial.display(), error = %cleanup, "partial file left behind");
                }
                Err(err)
            }
        }
    }
}

async fn write_verified(
    response: reqwest::Response,
    partial: &Path,
    expected_md5: Option<&str>,
) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut digest = Context::new();
    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.try_next().await? {
        digest.consume(&chunk);
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    let Some(expected) = expected_md5 else {
        return Ok(written);
    };
    let actual_md5 = format!("{:x}", digest.compute());
    if !actual_md5.eq_ignore_ascii_case(expected) {
        return Err(TransferError::IntegrityMismatch {
            expected_md5: expected.to_ascii_lowercase(),
            actual_md5,
        });
    }
    Ok(written)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    target.with_file_name(name)
}
