mod chain;
mod delete;
pub mod engine;
pub mod object;
mod pagination;
pub mod paths;
pub mod state;
pub mod transfer;
pub mod traverse;
mod upload;
pub mod versions;

#[cfg(test)]
mod engine_tests;

pub use delete::DeleteFailure;
pub use engine::{Browser, BrowserError};
pub use object::{BrowserObject, ObjectKind};
pub use state::{
    ActiveRange, BrowserState, Cursor, FailureReason, PaginationMode, SortDirection, SortKey,
    SortOrder, UploadStatus, UploadingObject,
};
pub use transfer::{Downloader, TransferError, UploadBody};
pub use traverse::{DirEntry, FileItem, PendingFile, TraverseError, UploadSource};
pub use upload::UploadOptions;
pub use versions::VersionCount;
