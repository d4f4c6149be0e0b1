use bucketview_core::{ObjectEntry, ObjectListing, VersionEntry};
use serde::Serialize;
use time::OffsetDateTime;

use super::paths::DELIMITER;

/// Zero-byte object that keeps an otherwise empty folder visible.
pub const FOLDER_PLACEHOLDER: &str = ".file_placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Folder,
}

/// One display row. `key` is relative to `path`; folders carry their name
/// without the trailing separator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserObject {
    pub key: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub kind: ObjectKind,
    pub is_delete_marker: bool,
    pub is_latest: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<BrowserObject>>,
}

impl BrowserObject {
    pub fn folder(path: &str, prefix: &str) -> Option<Self> {
        let name = relative_key(path, prefix)?.trim_end_matches(DELIMITER);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            key: name.to_string(),
            path: path.to_string(),
            version_id: None,
            size: 0,
            last_modified: OffsetDateTime::UNIX_EPOCH,
            kind: ObjectKind::Folder,
            is_delete_marker: false,
            is_latest: true,
            etag: None,
            versions: None,
        })
    }

    pub fn from_object(path: &str, entry: &ObjectEntry) -> Option<Self> {
        if is_placeholder(path, &entry.key) {
            return None;
        }
        Some(Self {
            key: relative_key(path, &entry.key)?.to_string(),
            path: path.to_string(),
            version_id: None,
            size: entry.size,
            last_modified: entry.last_modified,
            kind: ObjectKind::File,
            is_delete_marker: false,
            is_latest: true,
            etag: entry.etag.clone(),
            versions: None,
        })
    }

    pub fn from_version(path: &str, entry: &VersionEntry) -> Option<Self> {
        if is_placeholder(path, &entry.key) {
            return None;
        }
        Some(Self {
            key: relative_key(path, &entry.key)?.to_string(),
            path: path.to_string(),
            version_id: entry.version_id.clone(),
            size: entry.size,
            last_modified: entry.last_modified,
            kind: ObjectKind::File,
            is_delete_marker: entry.is_delete_marker,
            is_latest: entry.is_latest,
            etag: None,
            versions: None,
        })
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ObjectKind::Folder
    }

    /// Absolute storage key of a file row.
    pub fn full_key(&self) -> String {
        format!("{}{}", self.path, self.key)
    }

    /// Absolute prefix of a folder row.
    pub fn folder_prefix(&self) -> String {
        format!("{}{}{DELIMITER}", self.path, self.key)
    }

    /// Identity used for selection and pending deletions.
    pub fn composite_id(&self) -> String {
        format!(
            "{}{}{}",
            self.path,
            self.key,
            self.version_id.as_deref().unwrap_or_default()
        )
    }
}

pub fn relative_key<'a>(path: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(path)
}

/// Placeholders are the folder's own key and the empty-folder marker object.
pub fn is_placeholder(path: &str, key: &str) -> bool {
    match relative_key(path, key) {
        Some(rest) => rest.is_empty() || rest == FOLDER_PLACEHOLDER,
        None => true,
    }
}

/// Folders from common prefixes first, then files by modification time
/// ascending. The file sort is stable, so ties keep backend order.
pub fn from_listing(path: &str, listing: &ObjectListing) -> Vec<BrowserObject> {
    let mut files: Vec<BrowserObject> = listing
        .objects
        .iter()
        .filter_map(|entry| BrowserObject::from_object(path, entry))
        .collect();
    files.sort_by_key(|file| file.last_modified);
    folders_then(path, &listing.common_prefixes, files)
}

pub(crate) fn folders_then(
    path: &str,
    prefixes: &[String],
    files: Vec<BrowserObject>,
) -> Vec<BrowserObject> {
    let mut out: Vec<BrowserObject> = prefixes
        .iter()
        .filter_map(|prefix| BrowserObject::folder(path, prefix))
        .collect();
    out.extend(files);
    out
}
