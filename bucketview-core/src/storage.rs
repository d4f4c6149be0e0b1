use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use url::Url;

use crate::client::StorageError;

/// A live object returned by a delimited listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: OffsetDateTime,
    pub etag: Option<String>,
}

/// One entry of a version listing. Delete markers are folded into the same
/// shape with `is_delete_marker` set and a zero size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub key: String,
    pub version_id: Option<String>,
    pub size: u64,
    pub last_modified: OffsetDateTime,
    pub is_latest: bool,
    pub is_delete_marker: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub objects: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListVersionsRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub key_marker: Option<String>,
    pub version_id_marker: Option<String>,
    pub max_keys: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionListing {
    pub versions: Vec<VersionEntry>,
    pub common_prefixes: Vec<String>,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
    pub is_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// The subset of an S3-style object store the browser engine drives.
///
/// Every method is a suspension point; implementations must be safe to call
/// from several tasks at once.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn bucket(&self) -> &str;

    async fn list_objects(&self, request: ListObjectsRequest)
    -> Result<ObjectListing, StorageError>;

    async fn list_object_versions(
        &self,
        request: ListVersionsRequest,
    ) -> Result<VersionListing, StorageError>;

    /// Single-shot upload, used for small bodies and zero-byte folder placeholders.
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError>;

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str)
    -> Result<(), StorageError>;

    async fn delete_object(&self, key: &str, version_id: Option<&str>)
    -> Result<(), StorageError>;

    /// Copies `source_key` (optionally a specific version) onto `dest_key`,
    /// replacing metadata instead of carrying it over.
    async fn copy_object(
        &self,
        source_key: &str,
        source_version_id: Option<&str>,
        dest_key: &str,
    ) -> Result<(), StorageError>;

    async fn presign_get(
        &self,
        key: &str,
        version_id: Option<&str>,
        expires_in: Duration,
    ) -> Result<Url, StorageError>;
}
