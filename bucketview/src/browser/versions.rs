use std::collections::HashMap;
use std::fmt;

use bucketview_core::{ListVersionsRequest, ObjectStorage, VersionListing};

use crate::notify::ErrorSource;

use super::engine::{Browser, BrowserError};
use super::object::{BrowserObject, folders_then};
use super::pagination::Fetch;
use super::paths::{DELIMITER, normalize_prefix};
use super::state::ActiveRange;

/// Joins the key marker and the version-id marker of a version listing.
pub const TOKEN_SEPARATOR: char = '|';

/// Result of a bounded version lookup. `AtLeast` means the lookup stopped
/// before seeing every version, so the real count may be higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCount {
    Exact(usize),
    AtLeast(usize),
}

impl fmt::Display for VersionCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionCount::Exact(count) => write!(f, "{count}"),
            VersionCount::AtLeast(count) => write!(f, "{count}+"),
        }
    }
}

/// `None` when both markers are absent: the listing is complete and there is
/// nothing to persist.
pub fn join_token(key_marker: Option<&str>, version_marker: Option<&str>) -> Option<String> {
    let key_marker = key_marker.unwrap_or_default();
    let version_marker = version_marker.unwrap_or_default();
    if key_marker.is_empty() && version_marker.is_empty() {
        return None;
    }
    Some(format!("{key_marker}{TOKEN_SEPARATOR}{version_marker}"))
}

pub fn split_token(token: &str) -> (Option<String>, Option<String>) {
    let (key_marker, version_marker) = token
        .rsplit_once(TOKEN_SEPARATOR)
        .unwrap_or((token, ""));
    let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
    (non_empty(key_marker), non_empty(version_marker))
}

/// Groups a version listing by key. Each group is ordered most recent first
/// and represented by its newest entry, which carries the whole group in
/// `versions`. Representatives are ordered by time ascending behind the
/// folders.
pub fn group_versions(path: &str, listing: &VersionListing) -> Vec<BrowserObject> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<BrowserObject>> = HashMap::new();
    for entry in &listing.versions {
        let Some(object) = BrowserObject::from_version(path, entry) else {
            continue;
        };
        let group = groups.entry(object.key.clone()).or_insert_with(|| {
            order.push(object.key.clone());
            Vec::new()
        });
        group.push(object);
    }

    let mut rows: Vec<BrowserObject> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter_map(|mut group| {
            group.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
            let mut representative = group.first()?.clone();
            representative.versions = Some(group);
            Some(representative)
        })
        .collect();
    rows.sort_by_key(|row| row.last_modified);
    folders_then(path, &listing.common_prefixes, rows)
}

impl Browser {
    /// Fetches one page of versions and delete markers for `path`.
    pub async fn list_all_versions(
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
            self.fetch_versions(storage.as_ref(), &path, page.max(1), fetch)
                .await
        }
        .await;
        self.report(ErrorSource::Versions, result)
    }

    pub(super) async fn init_versions(&self, path: &str) -> Result<(), BrowserError> {
        let result = async {
            let path = normalize_prefix(path)?;
            let storage = self.storage()?;
            self.abort_count();
            let _guard = self.inner.refresh_lock.lock().await;
            self.fetch_versions(storage.as_ref(), &path, 1, Fetch::first_page())
                .await
        }
        .await;
        self.report(ErrorSource::Versions, result)
    }

    pub(super) async fn fetch_versions(
        &self,
        storage: &dyn ObjectStorage,
        path: &str,
        page: u32,
        fetch: Fetch,
    ) -> Result<(), BrowserError> {
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
        let (key_marker, version_id_marker) = token
            .as_deref()
            .map(split_token)
            .unwrap_or_default();

        let listing = storage
            .list_object_versions(ListVersionsRequest {
                prefix: path.to_string(),
                delimiter: Some(DELIMITER.to_string()),
                key_marker,
                version_id_marker,
                max_keys: Some(limit),
            })
            .await?;
        let rows = group_versions(path, &listing);
        let next = join_token(
            listing.next_key_marker.as_deref(),
            listing.next_version_id_marker.as_deref(),
        );
        tracing::debug!(
            path,
            page,
            versions = listing.versions.len(),
            rows = rows.len(),
            "versions listed"
        );

        let start = (page as usize - 1) * limit as usize;
        self.with_state(|state| {
            state.adopt_path(path, reset);
            state.cursor.page = page;
            state.active_range = ActiveRange {
                start,
                end: start + rows.len(),
            };
            state.has_more = listing.is_truncated;
            if fetch.persist_next_token
                && let Some(next) = next
            {
                state.continuation_tokens.insert(page + 1, next);
            }
            state.files = rows;
        });
        Ok(())
    }

    /// Estimates how many versions `key` has with a single bounded lookup.
    /// This is a display hint, not an exact count: a truncated lookup yields
    /// [`VersionCount::AtLeast`].
    pub async fn count_versions(&self, key: &str) -> Result<VersionCount, BrowserError> {
        let result = async {
            let storage = self.storage()?;
            let listing = storage
                .list_object_versions(ListVersionsRequest {
                    prefix: key.to_string(),
                    delimiter: Some(DELIMITER.to_string()),
                    max_keys: Some(self.inner.config.version_lookup_keys.max(1)),
                    ..ListVersionsRequest::default()
                })
                .await?;
            let count = listing.versions.iter().filter(|v| v.key == key).count();
            Ok(if listing.is_truncated || !listing.common_prefixes.is_empty() {
                VersionCount::AtLeast(count)
            } else {
                VersionCount::Exact(count)
            })
        }
        .await;
        self.report(ErrorSource::Versions, result)
    }
}
