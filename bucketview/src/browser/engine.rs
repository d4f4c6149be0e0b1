use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use bucketview_core::{ObjectStorage, StorageError};
use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::BrowserConfig;
use crate::notify::{CountHintStore, ErrorSource, MemoryCountHints, Notifier, TracingNotifier};

use super::chain::CompletionChain;
use super::delete::DeleteFailure;
use super::object::{BrowserObject, FOLDER_PLACEHOLDER};
use super::paths::{PathError, validate_name};
use super::state::{BrowserState, Cursor, PaginationMode, SortDirection, SortKey, SortOrder};
use super::transfer::{Downloader, TransferError};
use super::traverse::TraverseError;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("storage client is not initialized")]
    Uninitialized,
    #[error("already exists: {}", .names.join(", "))]
    DuplicateUpload { names: Vec<String> },
    #[error("no upload in progress for {0}")]
    MissingEntry(String),
    #[error("page {page} has not been reached yet")]
    PageNotReachable { page: u32 },
    #[error("{} delete(s) failed", .failures.len())]
    Deletion { failures: Vec<DeleteFailure> },
    #[error("{0} has no version to restore")]
    NoVersion(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("traverse error: {0}")]
    Traverse(#[from] TraverseError),
    #[error("upload completion queue is closed")]
    ChainClosed,
    #[error("background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Owned browsing context over one bucket.
///
/// Cloning is cheap and every clone drives the same state. State is only
/// touched inside short synchronous sections; listing refreshes are
/// serialized by `refresh_lock` and upload completions by the chain.
#[derive(Clone)]
pub struct Browser {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) config: BrowserConfig,
    storage: RwLock<Option<Arc<dyn ObjectStorage>>>,
    state: Mutex<BrowserState>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) hints: Arc<dyn CountHintStore>,
    pub(super) refresh_lock: tokio::sync::Mutex<()>,
    pub(super) count_task: Mutex<Option<JoinHandle<()>>>,
    pub(super) upload_ids: AtomicU64,
    chain: OnceLock<CompletionChain>,
    downloader: Downloader,
}

impl Browser {
    pub fn new(config: BrowserConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(TracingNotifier),
            Arc::new(MemoryCountHints::default()),
        )
    }

    pub fn with_parts(
        config: BrowserConfig,
        notifier: Arc<dyn Notifier>,
        hints: Arc<dyn CountHintStore>,
    ) -> Self {
        let state = BrowserState {
            cursor: Cursor {
                page: 1,
                limit: config.page_limit.max(1),
            },
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                config,
                storage: RwLock::new(None),
                state: Mutex::new(state),
                notifier,
                hints,
                refresh_lock: tokio::sync::Mutex::new(()),
                count_task: Mutex::new(None),
                upload_ids: AtomicU64::new(1),
                chain: OnceLock::new(),
                downloader: Downloader::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.inner.config
    }

    /// Attaches a storage client and resets state for its bucket. The
    /// remembered object count picks the initial pagination strategy.
    pub fn init(&self, storage: Arc<dyn ObjectStorage>) {
        let bucket = storage.bucket().to_string();
        let hint = self.inner.hints.load(&bucket);
        let pagination = self.mode_for(hint);
        *self
            .inner
            .storage
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(storage);
        let limit = self.inner.config.page_limit.max(1);
        self.with_state(|state| {
            *state = BrowserState {
                bucket: bucket.clone(),
                cursor: Cursor { page: 1, limit },
                pagination,
                total_objects: hint,
                ..Default::default()
            };
        });
        tracing::debug!(%bucket, ?pagination, ?hint, "browser initialized");
    }

    /// Swaps the storage client (new endpoint or credentials) and re-lists
    /// the current path. Sort order and the version toggle survive.
    pub async fn reinit(&self, storage: Arc<dyn ObjectStorage>) -> Result<(), BrowserError> {
        let (path, sort, show_versions) =
            self.with_state(|state| (state.path.clone(), state.sort, state.show_versions));
        self.abort_count();
        self.cancel_all_uploads();
        self.init(storage);
        self.with_state(|state| {
            state.sort = sort;
            state.show_versions = show_versions;
        });
        self.go_to(&path).await
    }

    /// Detaches the client and resets every piece of state to its default.
    pub fn clear(&self) {
        self.abort_count();
        self.cancel_all_uploads();
        *self
            .inner
            .storage
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        let limit = self.inner.config.page_limit.max(1);
        self.with_state(|state| {
            *state = BrowserState {
                cursor: Cursor { page: 1, limit },
                ..Default::default()
            };
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn snapshot(&self) -> BrowserState {
        self.with_state(|state| state.clone())
    }

    pub fn sorted_files(&self) -> Vec<BrowserObject> {
        self.with_state(|state| state.sorted_files())
    }

    pub fn displayed_objects(&self) -> Vec<BrowserObject> {
        self.with_state(|state| state.displayed_objects())
    }

    pub fn path(&self) -> String {
        self.with_state(|state| state.path.clone())
    }

    /// Navigates to `path`, listing live objects or versions depending on the
    /// version toggle.
    pub async fn go_to(&self, path: &str) -> Result<(), BrowserError> {
        if self.with_state(|state| state.show_versions) {
            self.init_versions(path).await
        } else {
            self.init_list(path).await
        }
    }

    pub async fn set_show_versions(&self, show: bool) -> Result<(), BrowserError> {
        let path = self.with_state(|state| {
            state.show_versions = show;
            state.path.clone()
        });
        self.go_to(&path).await
    }

    pub fn set_sort(&self, key: SortKey, direction: SortDirection) {
        self.with_state(|state| state.sort = SortOrder { key, direction });
    }

    /// Returns whether the object is selected afterwards.
    pub fn toggle_selected(&self, object: &BrowserObject) -> bool {
        self.with_state(|state| {
            if state.is_selected(object) {
                let id = object.composite_id();
                state.selected.retain(|s| s.composite_id() != id);
                false
            } else {
                state.selected.push(object.clone());
                true
            }
        })
    }

    pub fn set_selected(&self, objects: Vec<BrowserObject>) {
        self.with_state(|state| state.selected = objects);
    }

    pub fn clear_selection(&self) {
        self.with_state(|state| state.selected.clear());
    }

    /// Creates an empty folder under the current path by writing its
    /// placeholder object. Returns the placeholder key.
    pub async fn create_folder(&self, name: &str) -> Result<String, BrowserError> {
        let result = async {
            let storage = self.storage()?;
            let name = validate_name(name)?;
            let path = self.path();
            let key = format!("{path}{name}/{FOLDER_PLACEHOLDER}");
            storage.put_object(&key, Bytes::new()).await?;
            tracing::debug!(%key, "folder created");
            self.refresh_current().await?;
            Ok(key)
        }
        .await;
        self.report(ErrorSource::Folder, result)
    }

    /// Makes `object`'s version the current one by copying it onto its own key.
    pub async fn restore_version(&self, object: &BrowserObject) -> Result<(), BrowserError> {
        let result = async {
            let storage = self.storage()?;
            let key = object.full_key();
            let version_id = object
                .version_id
                .as_deref()
                .ok_or_else(|| BrowserError::NoVersion(key.clone()))?;
            storage.copy_object(&key, Some(version_id), &key).await?;
            tracing::debug!(%key, version_id, "version restored");
            self.refresh_current().await
        }
        .await;
        self.report(ErrorSource::Versions, result)
    }

    pub async fn download_url(&self, object: &BrowserObject) -> Result<Url, BrowserError> {
        let result = async {
            let storage = self.storage()?;
            Ok(storage
                .presign_get(
                    &object.full_key(),
                    object.version_id.as_deref(),
                    self.inner.config.presign_expiry,
                )
                .await?)
        }
        .await;
        self.report(ErrorSource::Download, result)
    }

    /// Downloads `object` to `target`, verifying a plain MD5 ETag when the
    /// listing carried one. Returns the number of bytes written.
    pub async fn download_to_path(
        &self,
        object: &BrowserObject,
        target: &Path,
    ) -> Result<u64, BrowserError> {
        let url = self.download_url(object).await?;
        let expected = object.etag.as_deref().and_then(md5_etag);
        let result = self
            .inner
            .downloader
            .download(url, target, expected)
            .await
            .map_err(BrowserError::from);
        self.report(ErrorSource::Download, result)
    }

    pub(super) fn storage(&self) -> Result<Arc<dyn ObjectStorage>, BrowserError> {
        self.inner
            .storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrowserError::Uninitialized)
    }

    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut BrowserState) -> R) -> R {
        f(&mut lock(&self.inner.state))
    }

    pub(super) fn chain(&self) -> &CompletionChain {
        self.inner.chain.get_or_init(CompletionChain::spawn)
    }

    pub(super) fn mode_for(&self, count: Option<u64>) -> PaginationMode {
        match count {
            Some(count) if count > self.inner.config.windowed_threshold => {
                PaginationMode::Windowed
            }
            _ => PaginationMode::Standard,
        }
    }

    /// Funnels a failed operation to the notifier before handing it back.
    pub(super) fn report<T>(
        &self,
        source: ErrorSource,
        result: Result<T, BrowserError>,
    ) -> Result<T, BrowserError> {
        if let Err(err) = &result {
            self.inner.notifier.error(source, &err.to_string());
        }
        result
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multipart ETags ("<hash>-<parts>") are not content hashes.
fn md5_etag(etag: &str) -> Option<&str> {
    let etag = etag.trim_matches('"');
    (etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())).then_some(etag)
}
