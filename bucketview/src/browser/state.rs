use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::object::{BrowserObject, ObjectKind};

const DEFAULT_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub page: u32,
    pub limit: u32,
}

impl Cursor {
    /// Absolute index of the first row on the current page.
    pub fn first_index(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit as usize
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Absolute item-index window currently materialized in `files`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActiveRange {
    pub start: usize,
    pub end: usize,
}

impl ActiveRange {
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PaginationMode {
    #[default]
    Standard,
    Windowed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Modified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SortOrder {
    pub key: SortKey,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadStatus {
    Queued,
    InProgress,
    Finished,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Finished | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    Generic,
    TooBig,
    /// Quota or limit message reported by the backend, shown verbatim.
    Backend(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Generic => f.write_str("Upload failed"),
            FailureReason::TooBig => f.write_str("File is too big to upload"),
            FailureReason::Backend(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadingObject {
    /// Absolute storage key.
    pub key: String,
    /// Distinguishes successive attempts for the same key.
    pub id: u64,
    pub bucket: String,
    pub path: String,
    pub size: u64,
    pub status: UploadStatus,
    pub progress: u8,
    pub failure: Option<FailureReason>,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserState {
    pub bucket: String,
    pub path: String,
    pub files: Vec<BrowserObject>,
    pub uploading: Vec<UploadingObject>,
    pub selected: Vec<BrowserObject>,
    pub pending_deletions: BTreeSet<String>,
    pub cursor: Cursor,
    pub continuation_tokens: BTreeMap<u32, String>,
    pub active_range: ActiveRange,
    pub pagination: PaginationMode,
    pub has_more: bool,
    pub show_versions: bool,
    pub total_objects: Option<u64>,
    pub sort: SortOrder,
    pub first_uploaded_key: Option<String>,
}

impl BrowserState {
    pub(crate) fn reset_pagination(&mut self) {
        self.cursor.page = 1;
        self.continuation_tokens.clear();
        self.active_range = ActiveRange::default();
        self.has_more = false;
    }

    /// Applied when a listing commits. Tokens and the window belong to one
    /// path, so they are dropped on navigation or an explicit reset.
    pub(crate) fn adopt_path(&mut self, path: &str, reset: bool) {
        let moved = self.path != path;
        if moved {
            self.selected.clear();
            self.total_objects = None;
            self.path = path.to_string();
        }
        if moved || reset {
            self.continuation_tokens.clear();
            self.active_range = ActiveRange::default();
        }
    }

    /// Current page's entries ordered by the active sort; folders always lead.
    pub fn sorted_files(&self) -> Vec<BrowserObject> {
        let mut files = self.files.clone();
        let order = self.sort;
        files.sort_by(|a, b| match (a.kind, b.kind) {
            (ObjectKind::Folder, ObjectKind::File) => Ordering::Less,
            (ObjectKind::File, ObjectKind::Folder) => Ordering::Greater,
            _ => {
                let ordering = match order.key {
                    SortKey::Name => a.key.cmp(&b.key),
                    SortKey::Size => a.size.cmp(&b.size),
                    SortKey::Modified => a.last_modified.cmp(&b.last_modified),
                };
                match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            }
        });
        files
    }

    /// The rows for the current cursor. In windowed mode `files` holds a
    /// whole batch, so the slice starts at the page's offset inside the
    /// active range rather than at zero.
    pub fn displayed_objects(&self) -> Vec<BrowserObject> {
        let limit = self.cursor.limit.max(1) as usize;
        let offset = match self.pagination {
            PaginationMode::Standard => 0,
            PaginationMode::Windowed => self
                .cursor
                .first_index()
                .saturating_sub(self.active_range.start),
        };
        self.sorted_files()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    pub fn is_pending_deletion(&self, object: &BrowserObject) -> bool {
        self.pending_deletions.contains(&object.composite_id())
    }

    pub fn is_selected(&self, object: &BrowserObject) -> bool {
        let id = object.composite_id();
        self.selected.iter().any(|s| s.composite_id() == id)
    }

    pub fn upload(&self, key: &str) -> Option<&UploadingObject> {
        self.uploading.iter().find(|u| u.key == key)
    }

    pub(crate) fn upload_mut(&mut self, key: &str) -> Option<&mut UploadingObject> {
        self.uploading.iter_mut().find(|u| u.key == key)
    }

    /// The entry for `key` only while it still belongs to attempt `id`.
    pub(crate) fn attempt_mut(&mut self, key: &str, id: u64) -> Option<&mut UploadingObject> {
        self.uploading
            .iter_mut()
            .find(|u| u.key == key && u.id == id)
    }

    pub(crate) fn remove_file(&mut self, object: &BrowserObject) {
        let id = object.composite_id();
        self.files.retain(|f| f.composite_id() != id);
        self.selected.retain(|f| f.composite_id() != id);
    }
}
