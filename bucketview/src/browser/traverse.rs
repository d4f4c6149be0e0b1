use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use walkdir::WalkDir;

use super::paths::DELIMITER;
use super::transfer::UploadBody;

#[derive(Debug, Error)]
pub enum TraverseError {
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8(PathBuf),
    #[error("{0} is outside the dropped directory")]
    Outside(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FileItem {
    pub name: String,
    pub size: u64,
    pub body: UploadBody,
}

impl FileItem {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            body: UploadBody::Bytes(bytes),
        }
    }

    pub fn from_path(name: impl Into<String>, path: PathBuf, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            body: UploadBody::File(path),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DirEntry {
    File(FileItem),
    Dir { name: String, entries: Vec<DirEntry> },
}

/// Every shape an upload request can arrive in.
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(FileItem),
    Files(Vec<FileItem>),
    /// An in-memory tree rooted at a directory named `name`.
    Directory { name: String, entries: Vec<DirEntry> },
    /// A local file or directory. Directories keep their own name as the top
    /// level of every key.
    Local(PathBuf),
}

impl UploadSource {
    /// Local sources read the filesystem while iterating.
    pub(super) fn is_blocking(&self) -> bool {
        matches!(self, UploadSource::Local(_))
    }
}

/// A file paired with its directory path relative to the upload target,
/// either empty or ending in the separator.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub relative_path: String,
    pub item: FileItem,
}

impl PendingFile {
    pub fn relative_key(&self) -> String {
        format!("{}{}", self.relative_path, self.item.name)
    }
}

/// Lazy depth-first walk. Memory grows with tree depth, not with the number
/// of files.
pub struct Traversal {
    inner: Walk,
}

enum Walk {
    Tree(Vec<Frame>),
    Local { base: PathBuf, walker: walkdir::IntoIter },
}

struct Frame {
    prefix: String,
    entries: std::vec::IntoIter<DirEntry>,
}

impl Frame {
    fn new(prefix: String, entries: Vec<DirEntry>) -> Self {
        Self {
            prefix,
            entries: entries.into_iter(),
        }
    }
}

pub fn traverse(source: UploadSource) -> Traversal {
    let inner = match source {
        UploadSource::File(item) => Walk::Tree(vec![Frame::new(
            String::new(),
            vec![DirEntry::File(item)],
        )]),
        UploadSource::Files(items) => Walk::Tree(vec![Frame::new(
            String::new(),
            items.into_iter().map(DirEntry::File).collect(),
        )]),
        UploadSource::Directory { name, entries } => {
            Walk::Tree(vec![Frame::new(format!("{name}{DELIMITER}"), entries)])
        }
        UploadSource::Local(root) => {
            let base = root.parent().map(Path::to_path_buf).unwrap_or_default();
            Walk::Local {
                base,
                walker: WalkDir::new(root).sort_by_file_name().into_iter(),
            }
        }
    };
    Traversal { inner }
}

impl Iterator for Traversal {
    type Item = Result<PendingFile, TraverseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Walk::Tree(stack) => next_in_tree(stack).map(Ok),
            Walk::Local { base, walker } => loop {
                let entry = match walker.next()? {
                    Ok(entry) => entry,
                    Err(err) => return Some(Err(err.into())),
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                return Some(local_file(base, entry));
            },
        }
    }
}

fn next_in_tree(stack: &mut Vec<Frame>) -> Option<PendingFile> {
    loop {
        let top = stack.last_mut()?;
        match top.entries.next() {
            Some(DirEntry::File(item)) => {
                return Some(PendingFile {
                    relative_path: top.prefix.clone(),
                    item,
                });
            }
            Some(DirEntry::Dir { name, entries }) => {
                let prefix = format!("{}{name}{DELIMITER}", top.prefix);
                stack.push(Frame::new(prefix, entries));
            }
            None => {
                stack.pop();
            }
        }
    }
}

fn local_file(base: &Path, entry: walkdir::DirEntry) -> Result<PendingFile, TraverseError> {
    let size = entry.metadata()?.len();
    let path = entry.into_path();
    let relative = path
        .strip_prefix(base)
        .map_err(|_| TraverseError::Outside(path.clone()))?;
    let mut segments = Vec::new();
    for component in relative.components() {
        let segment = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| TraverseError::NonUtf8(path.clone()))?;
        segments.push(segment.to_string());
    }
    let name = segments
        .pop()
        .ok_or_else(|| TraverseError::Outside(path.clone()))?;
    let relative_path = segments
        .iter()
        .map(|segment| format!("{segment}{DELIMITER}"))
        .collect();
    Ok(PendingFile {
        relative_path,
        item: FileItem::from_path(name, path, size),
    })
}
