mod client;
pub mod memory;
mod storage;

pub use client::{S3Storage, StorageConfig, StorageError};
pub use memory::{CallStats, MemoryStorage};
pub use storage::{
    CompletedPart, ListObjectsRequest, ListVersionsRequest, ObjectEntry, ObjectListing,
    ObjectStorage, VersionEntry, VersionListing,
};
