use std::sync::Arc;

use bucketview_core::{ListObjectsRequest, ObjectListing, ObjectStorage, StorageError};

use crate::notify::ErrorSource;

use super::engine::{Browser, BrowserError, lock};
use super::object::from_listing;
use super::paths::{DELIMITER, normalize_prefix};
use super::state::{ActiveRange, PaginationMode};

/// How a single listing call treats the cached pagination state.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Fetch {
    /// Record the continuation token for the following page or batch.
    pub persist_next_token: bool,
    /// Drop cached tokens and the active window before committing.
    pub reset: bool,
    /// Refetch even if the page is already materialized.
    pub force: bool,
}

impl Fetch {
    pub(super) fn navigate() -> Self {
        Self {
            persist_next_token: true,
            ..Self::default()
        }
    }

    pub(super) fn first_page() -> Self {
        Self {
            persist_next_token: true,
            reset: true,
            force: true,
        }
    }

    pub(super) fn refresh() -> Self {
        Self {
            persist_next_token: true,
            force: true,
            ..Self::default()
        }
    }
}

/// What the first listing of a prefix already counted, so the background
/// count resumes after it instead of starting over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct CountSeed {
    pub listed: u64,
    /// Token after the first listing; `None` when it reached the end.
    pub resume: Option<String>,
}

impl CountSeed {
    fn from_first(listing: &ObjectListing) -> Self {
        Self {
            listed: (listing.objects.len() + listing.common_prefixes.len()) as u64,
            resume: listing
                .next_continuation_token
                .clone()
                .filter(|_| listing.is_truncated),
        }
    }
}

impl Browser {
    /// Lists the first page of `path` and starts a background count of the
    /// whole prefix. The count may switch the pagination strategy.
    pub async fn init_list(&self, path: &str) -> Result<(), BrowserError> {
        let result = self.start_listing(path).await;
        self.report(ErrorSource::Listing, result)
    }

    async fn start_listing(&self, path: &str) -> Result<(), BrowserError> {
        let path = normalize_prefix(path)?;
        let storage = self.storage()?;
        self.abort_count();
        let seed = {
            let _guard = self.inner.refresh_lock.lock().await;
            self.fetch_objects(storage.as_ref(), &path, 1, Fetch::first_page())
                .await?
        };
        let browser = self.clone();
        let task =
            tokio::spawn(async move { browser.count_and_adjust(storage, path, seed).await });
        *lock(&self.inner.count_task) = Some(task);
        Ok(())
    }

    /// Fetches one page of `path` using the token recorded for `page`.
    pub async fn list_page(
        &self,
        path: &str,
        page: u32,
        persist_next_token: bool,
    ) -> Result<(), BrowserError> {
        let result = async {
            let path = normalize_prefix(path)?;
            let storage = self.storage()?;
            let _guard = self.inner.refresh_lock.lock().await;
            let fetch = Fetch {
                persist_next_token,
                ..Fetch::default()
            };
            self.fetch_objects(storage.as_ref(), &path, page.max(1), fetch)
                .await
                .map(drop)
        }
        .await;
        self.report(ErrorSource::Listing, result)
    }

    pub async fn next_page(&self) -> Result<(), BrowserError> {
        let page = self.with_state(|state| state.cursor.page) + 1;
        self.go_to_page(page).await
    }

    pub async fn go_to_page(&self, page: u32) -> Result<(), BrowserError> {
        let show_versions = self.with_state(|state| state.show_versions);
        let result = async {
            let storage = self.storage()?;
            let _guard = self.inner.refresh_lock.lock().await;
            let path = self.path();
            if show_versions {
                self.fetch_versions(storage.as_ref(), &path, page.max(1), Fetch::navigate())
                    .await
            } else {
                self.fetch_objects(storage.as_ref(), &path, page.max(1), Fetch::navigate())
                    .await
                    .map(drop)
            }
        }
        .await;
        let source = if show_versions {
            ErrorSource::Versions
        } else {
            ErrorSource::Listing
        };
        self.report(source, result)
    }

    /// Changes the page size; cached tokens no longer line up, so paging
    /// restarts at page 1.
    pub async fn set_limit(&self, limit: u32) -> Result<(), BrowserError> {
        self.with_state(|state| {
            state.cursor.limit = limit.max(1);
            state.reset_pagination();
        });
        self.go_to_page(1).await
    }

    /// Re-lists the current page in whatever view is active. Falls back to
    /// page 1 when the page's token is no longer known.
    pub async fn refresh_current(&self) -> Result<(), BrowserError> {
        let storage = self.storage()?;
        let _guard = self.inner.refresh_lock.lock().await;
        let (path, page, show_versions) = self.with_state(|state| {
            (state.path.clone(), state.cursor.page, state.show_versions)
        });
        let refresh = |page: u32, fetch: Fetch| {
            let storage = storage.as_ref();
            let path = path.as_str();
            async move {
                if show_versions {
                    self.fetch_versions(storage, path, page, fetch).await
                } else {
                    self.fetch_objects(storage, path, page, fetch).await.map(drop)
                }
            }
        };
        match refresh(page, Fetch::refresh()).await {
            Err(BrowserError::PageNotReachable { .. }) => {
                tracing::debug!(%path, page, "page token lost, refreshing from page 1");
                refresh(1, Fetch::first_page()).await
            }
            other => other,
        }
    }

    /// Resolves once the background count for the last `init_list` finished.
    pub async fn wait_for_count(&self) {
        let task = lock(&self.inner.count_task).take();
        if let Some(task) = task
            && let Err(err) = task.await
            && !err.is_cancelled()
        {
            tracing::warn!(error = %err, "object count task failed");
        }
    }

    pub(super) fn abort_count(&self) {
        if let Some(task) = lock(&self.inner.count_task).take() {
            task.abort();
        }
    }

    /// Returns a count seed when the call listed from the first key.
    pub(super) async fn fetch_objects(
        &self,
        storage: &dyn ObjectStorage,
        path: &str,
        page: u32,
        fetch: Fetch,
    ) -> Result<Option<CountSeed>, BrowserError> {
        match self.with_state(|state| state.pagination) {
            PaginationMode::Standard => self.fetch_page(storage, path, page, fetch).await,
            PaginationMode::Windowed => self.fetch_window(storage, path, page, fetch).await,
        }
    }

    async fn fetch_page(
        &self,
        storage: &dyn ObjectStorage,
        path: &str,
        page: u32,
        fetch: Fetch,
    ) -> Result<Option<CountSeed>, BrowserError> {
        let (token, limit, reset) = self.with_state(|state| {
            let reset = fetch.reset || state.path != path;
            let token = if reset {
                None
            } else {
                state.continuation_tokens.get(&page).cloned()
            };
            (token, state.cursor.limit.max(1), reset)
        });
        if page > 1 && token.is_none() {
            return Err(BrowserError::PageNotReachable { page });
        }

        let listing = storage
            .list_objects(ListObjectsRequest {
                prefix: path.to_string(),
                delimiter: Some(DELIMITER.to_string()),
                continuation_token: token,
                max_keys: Some(limit),
            })
            .await?;
        let seed = (page == 1).then(|| CountSeed::from_first(&listing));
        let files = from_listing(path, &listing);
        tracing::debug!(
            path,
            page,
            rows = files.len(),
            truncated = listing.is_truncated,
            "page listed"
        );

        let start = (page as usize - 1) * limit as usize;
        self.with_state(|state| {
            state.adopt_path(path, reset);
            state.cursor.page = page;
            state.active_range = ActiveRange {
                start,
                end: start + files.len(),
            };
            state.has_more = listing.is_truncated;
            if fetch.persist_next_token
                && let Some(next) = listing.next_continuation_token
            {
                state.continuation_tokens.insert(page + 1, next);
            }
            state.files = files;
        });
        Ok(seed)
    }

    /// Windowed paging fetches whole batches of `batch_len` keys and serves
    /// every UI page that falls inside the materialized window without a
    /// round trip. Tokens are recorded under the first page of each batch.
    async fn fetch_window(
        &self,
        storage: &dyn ObjectStorage,
        path: &str,
        page: u32,
        fetch: Fetch,
    ) -> Result<Option<CountSeed>, BrowserError> {
        let limit = self.with_state(|state| state.cursor.limit.max(1));
        let batch = self.inner.config.batch_len(limit) as usize;
        let limit = limit as usize;
        let index = (page as usize - 1) * limit;
        let batch_index = index / batch;
        let pages_per_batch = (batch / limit) as u32;
        let batch_page = batch_index as u32 * pages_per_batch + 1;
        let next_batch_page = batch_page + pages_per_batch;

        let (token, reset, reused) = self.with_state(|state| {
            let reset = fetch.reset || state.path != path;
            if !reset && !fetch.force && state.active_range.contains(index) {
                state.cursor.page = page;
                state.has_more = index + limit < state.active_range.end
                    || state.continuation_tokens.contains_key(&next_batch_page);
                return (None, reset, true);
            }
            let token = if reset {
                None
            } else {
                state.continuation_tokens.get(&batch_page).cloned()
            };
            (token, reset, false)
        });
        if reused {
            tracing::trace!(path, page, "page served from active window");
            return Ok(None);
        }
        if batch_page > 1 && token.is_none() {
            return Err(BrowserError::PageNotReachable { page });
        }

        let listing = storage
            .list_objects(ListObjectsRequest {
                prefix: path.to_string(),
                delimiter: Some(DELIMITER.to_string()),
                continuation_token: token,
                max_keys: Some(batch as u32),
            })
            .await?;
        let seed = (batch_page == 1).then(|| CountSeed::from_first(&listing));
        let files = from_listing(path, &listing);
        tracing::debug!(
            path,
            page,
            batch_page,
            rows = files.len(),
            truncated = listing.is_truncated,
            "batch listed"
        );

        let start = batch_index * batch;
        self.with_state(|state| {
            state.adopt_path(path, reset);
            state.cursor.page = page;
            state.active_range = ActiveRange {
                start,
                end: start + files.len(),
            };
            state.has_more = index + limit < state.active_range.end || listing.is_truncated;
            if fetch.persist_next_token
                && let Some(next) = listing.next_continuation_token
            {
                state.continuation_tokens.insert(next_batch_page, next);
            }
            state.files = files;
        });
        Ok(seed)
    }

    async fn count_and_adjust(
        &self,
        storage: Arc<dyn ObjectStorage>,
        path: String,
        seed: Option<CountSeed>,
    ) {
        let page_size = self.inner.config.native_page_size;
        let count = match count_prefix(storage.as_ref(), &path, page_size, seed).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(%path, error = %err, "object count failed");
                    return;
                }
            };
        let bucket = storage.bucket().to_string();
        let mode = self.mode_for(Some(count));
        let outcome = self.with_state(|state| {
            if state.path != path || state.bucket != bucket {
                return None;
            }
            state.total_objects = Some(count);
            let switched = state.pagination != mode && !state.show_versions;
            if switched {
                state.pagination = mode;
                state.reset_pagination();
            }
            Some(switched)
        });
        let Some(switched) = outcome else {
            tracing::debug!(%path, count, "discarding count for a path no longer shown");
            return;
        };
        self.inner.hints.store(&bucket, count);
        tracing::debug!(%path, count, ?mode, switched, "prefix counted");

        if switched {
            let _guard = self.inner.refresh_lock.lock().await;
            if let Err(err) = self
                .fetch_objects(storage.as_ref(), &path, 1, Fetch::first_page())
                .await
            {
                self.inner
                    .notifier
                    .error(ErrorSource::Listing, &err.to_string());
            }
        }
    }
}

/// Drains the native pager for `path`, counting objects and common
/// prefixes, starting after `seed` when the first listing is already known.
/// A non-root prefix owns one invisible placeholder, which is not counted.
pub(super) async fn count_prefix(
    storage: &dyn ObjectStorage,
    path: &str,
    page_size: u32,
    seed: Option<CountSeed>,
) -> Result<u64, StorageError> {
    let (mut total, mut token) = match seed {
        Some(CountSeed {
            listed,
            resume: None,
        }) => return Ok(without_placeholder(path, listed)),
        Some(CountSeed { listed, resume }) => (listed, resume),
        None => (0, None),
    };
    loop {
        let listing = storage
            .list_objects(ListObjectsRequest {
                prefix: path.to_string(),
                delimiter: Some(DELIMITER.to_string()),
                continuation_token: token.take(),
                max_keys: Some(page_size.max(1)),
            })
            .await?;
        total += (listing.objects.len() + listing.common_prefixes.len()) as u64;
        match listing.next_continuation_token {
            Some(next) if listing.is_truncated => token = Some(next),
            _ => break,
        }
    }
    Ok(without_placeholder(path, total))
}

fn without_placeholder(path: &str, total: u64) -> u64 {
    if path.is_empty() {
        total
    } else {
        total.saturating_sub(1)
    }
}
