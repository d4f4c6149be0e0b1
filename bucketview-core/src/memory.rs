use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use url::Url;

use crate::client::StorageError;
use crate::storage::{
    CompletedPart, ListObjectsRequest, ListVersionsRequest, ObjectEntry, ObjectListing,
    ObjectStorage, VersionEntry, VersionListing,
};

const DEFAULT_MAX_KEYS: u32 = 1000;
// 2024-01-01T00:00:00Z; the logical clock starts here.
const CLOCK_BASE: i64 = 1_704_067_200;

/// In-process object store with optional versioning.
///
/// Intended for tests and embedding. Every trait call is counted, part uploads
/// and deletes are tracked by an in-flight gauge, and an optional latency is
/// applied before each call so overlapping calls are observable.
pub struct MemoryStorage {
    bucket: String,
    versioning: bool,
    inner: Mutex<Inner>,
    latency: Mutex<Option<Duration>>,
    failing_deletes: Mutex<HashSet<String>>,
    failing_puts: Mutex<HashSet<String>>,
    failing_lists: AtomicBool,
    presign_base: Mutex<Option<Url>>,
    counters: Counters,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Vec<StoredVersion>>,
    uploads: HashMap<String, PendingUpload>,
    clock: i64,
    next_version: u64,
    next_upload: u64,
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: Option<String>,
    // None marks a delete marker.
    body: Option<Bytes>,
    modified: OffsetDateTime,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Default)]
struct Counters {
    list_objects: AtomicUsize,
    list_versions: AtomicUsize,
    put_object: AtomicUsize,
    create_multipart: AtomicUsize,
    upload_part: AtomicUsize,
    complete_multipart: AtomicUsize,
    abort_multipart: AtomicUsize,
    delete_object: AtomicUsize,
    copy_object: AtomicUsize,
    parts_in_flight: AtomicUsize,
    peak_parts_in_flight: AtomicUsize,
    deletes_in_flight: AtomicUsize,
    peak_deletes_in_flight: AtomicUsize,
}

/// Snapshot of the call counters of a [`MemoryStorage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub list_objects: usize,
    pub list_versions: usize,
    pub put_object: usize,
    pub create_multipart: usize,
    pub upload_part: usize,
    pub complete_multipart: usize,
    pub abort_multipart: usize,
    pub delete_object: usize,
    pub copy_object: usize,
    pub peak_parts_in_flight: usize,
    pub peak_deletes_in_flight: usize,
}

impl CallStats {
    pub fn transport_writes(&self) -> usize {
        self.put_object + self.create_multipart + self.upload_part + self.complete_multipart
    }
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStorage {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self::build(bucket.into(), false)
    }

    pub fn versioned(bucket: impl Into<String>) -> Self {
        Self::build(bucket.into(), true)
    }

    fn build(bucket: String, versioning: bool) -> Self {
        Self {
            bucket,
            versioning,
            inner: Mutex::new(Inner::default()),
            latency: Mutex::new(None),
            failing_deletes: Mutex::new(HashSet::new()),
            failing_puts: Mutex::new(HashSet::new()),
            failing_lists: AtomicBool::new(false),
            presign_base: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    /// Makes every delete of `key` fail with `AccessDenied`.
    pub fn fail_deletes_for(&self, key: impl Into<String>) {
        lock(&self.failing_deletes).insert(key.into());
    }

    /// Makes writes of `key` (single put or multipart start) fail with a
    /// transport error.
    pub fn fail_puts_for(&self, key: impl Into<String>) {
        lock(&self.failing_puts).insert(key.into());
    }

    /// While set, every object listing fails with a transport error.
    pub fn set_listing_outage(&self, down: bool) {
        self.failing_lists.store(down, Ordering::SeqCst);
    }

    /// Presigned URLs are issued under `base` instead of `memory://`, so a
    /// local HTTP server can answer them.
    pub fn with_presign_base(self, base: Url) -> Self {
        *lock(&self.presign_base) = Some(base);
        self
    }

    /// Seeds an object without touching the call counters.
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Bytes>) {
        let mut inner = lock(&self.inner);
        let modified = inner.tick();
        inner.store(self.versioning, key.into(), Some(body.into()), modified);
    }

    /// Seeds an object with an explicit modification time.
    pub fn insert_at(&self, key: impl Into<String>, body: impl Into<Bytes>, modified: OffsetDateTime) {
        let mut inner = lock(&self.inner);
        inner.store(self.versioning, key.into(), Some(body.into()), modified);
    }

    /// Seeds a delete marker (versioned stores only keep it as a version).
    pub fn insert_delete_marker(&self, key: impl Into<String>) {
        let mut inner = lock(&self.inner);
        let modified = inner.tick();
        inner.store(self.versioning, key.into(), None, modified);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.inner)
            .objects
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|version| version.body.clone())
    }

    /// Keys whose current version is live.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner)
            .objects
            .iter()
            .filter(|(_, versions)| versions.last().is_some_and(|v| v.body.is_some()))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of stored versions (delete markers included) for `key`.
    pub fn version_count(&self, key: &str) -> usize {
        lock(&self.inner).objects.get(key).map_or(0, Vec::len)
    }

    pub fn open_uploads(&self) -> usize {
        lock(&self.inner).uploads.len()
    }

    pub fn stats(&self) -> CallStats {
        let c = &self.counters;
        CallStats {
            list_objects: c.list_objects.load(Ordering::SeqCst),
            list_versions: c.list_versions.load(Ordering::SeqCst),
            put_object: c.put_object.load(Ordering::SeqCst),
            create_multipart: c.create_multipart.load(Ordering::SeqCst),
            upload_part: c.upload_part.load(Ordering::SeqCst),
            complete_multipart: c.complete_multipart.load(Ordering::SeqCst),
            abort_multipart: c.abort_multipart.load(Ordering::SeqCst),
            delete_object: c.delete_object.load(Ordering::SeqCst),
            copy_object: c.copy_object.load(Ordering::SeqCst),
            peak_parts_in_flight: c.peak_parts_in_flight.load(Ordering::SeqCst),
            peak_deletes_in_flight: c.peak_deletes_in_flight.load(Ordering::SeqCst),
        }
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Inner {
    fn tick(&mut self) -> OffsetDateTime {
        self.clock += 1;
        OffsetDateTime::from_unix_timestamp(CLOCK_BASE + self.clock)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    fn store(&mut self, versioning: bool, key: String, body: Option<Bytes>, modified: OffsetDateTime) {
        if !versioning {
            match body {
                Some(body) => {
                    self.objects.insert(
                        key,
                        vec![StoredVersion {
                            version_id: None,
                            body: Some(body),
                            modified,
                        }],
                    );
                }
                None => {
                    self.objects.remove(&key);
                }
            }
            return;
        }
        self.next_version += 1;
        let version = StoredVersion {
            version_id: Some(format!("v{:06}", self.next_version)),
            body,
            modified,
        };
        self.objects.entry(key).or_default().push(version);
    }
}

enum Emit {
    Object(String),
    Prefix(String),
}

fn group_of(prefix: &str, delimiter: Option<&str>, key: &str) -> Emit {
    let rest = &key[prefix.len()..];
    match delimiter.filter(|d| !d.is_empty()).and_then(|d| rest.find(d).map(|i| i + d.len())) {
        Some(end) => Emit::Prefix(format!("{prefix}{}", &rest[..end])),
        None => Emit::Object(key.to_string()),
    }
}

fn service_error(operation: &'static str, code: &str, message: impl Into<String>) -> StorageError {
    StorageError::Service {
        operation,
        code: Some(code.to_string()),
        message: message.into(),
    }
}

fn connection_reset(operation: &'static str) -> StorageError {
    StorageError::Transport {
        operation,
        message: "connection reset by peer".to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(
        &self,
        request: ListObjectsRequest,
    ) -> Result<ObjectListing, StorageError> {
        self.counters.list_objects.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.failing_lists.load(Ordering::SeqCst) {
            return Err(connection_reset("ListObjectsV2"));
        }

        // Tokens are "o:<key>" after an object and "p:<prefix>" after a common prefix.
        let resume = request
            .continuation_token
            .as_deref()
            .map(|token| match token.split_once(':') {
                Some(("o", key)) => Ok(Emit::Object(key.to_string())),
                Some(("p", prefix)) => Ok(Emit::Prefix(prefix.to_string())),
                _ => Err(service_error(
                    "ListObjectsV2",
                    "InvalidArgument",
                    "The continuation token provided is incorrect",
                )),
            })
            .transpose()?;
        let max_keys = request.max_keys.unwrap_or(DEFAULT_MAX_KEYS).max(1) as usize;
        let delimiter = request.delimiter.as_deref();

        let inner = lock(&self.inner);
        let mut listing = ObjectListing::default();
        let mut last: Option<String> = None;
        for (key, versions) in inner.objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            let Some(current) = versions.last() else {
                continue;
            };
            let Some(body) = current.body.as_ref() else {
                continue;
            };
            match &resume {
                Some(Emit::Object(after)) if key <= after => continue,
                Some(Emit::Prefix(after)) if key <= after || key.starts_with(after.as_str()) => {
                    continue;
                }
                _ => {}
            }
            let emit = group_of(&request.prefix, delimiter, key);
            if let Emit::Prefix(prefix) = &emit
                && listing.common_prefixes.last() == Some(prefix)
            {
                continue;
            }
            if listing.objects.len() + listing.common_prefixes.len() == max_keys {
                listing.is_truncated = true;
                break;
            }
            match emit {
                Emit::Object(key) => {
                    last = Some(format!("o:{key}"));
                    listing.objects.push(ObjectEntry {
                        key,
                        size: body.len() as u64,
                        last_modified: current.modified,
                        etag: Some(format!("\"{:x}\"", md5::compute(body))),
                    });
                }
                Emit::Prefix(prefix) => {
                    last = Some(format!("p:{prefix}"));
                    listing.common_prefixes.push(prefix);
                }
            }
        }
        if listing.is_truncated {
            listing.next_continuation_token = last;
        }
        Ok(listing)
    }

    async fn list_object_versions(
        &self,
        request: ListVersionsRequest,
    ) -> Result<VersionListing, StorageError> {
        self.counters.list_versions.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let max_keys = request.max_keys.unwrap_or(DEFAULT_MAX_KEYS).max(1) as usize;
        let delimiter = request.delimiter.as_deref();
        let key_marker = request.key_marker.as_deref();
        let version_marker = request.version_id_marker.as_deref();

        let inner = lock(&self.inner);
        let mut listing = VersionListing::default();
        let mut last: Option<(String, Option<String>)> = None;
        'keys: for (key, versions) in inner.objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            match group_of(&request.prefix, delimiter, key) {
                Emit::Prefix(prefix) => {
                    if key_marker.is_some_and(|marker| prefix.as_str() <= marker)
                        || listing.common_prefixes.last() == Some(&prefix)
                    {
                        continue;
                    }
                    if listing.versions.len() + listing.common_prefixes.len() == max_keys {
                        listing.is_truncated = true;
                        break;
                    }
                    last = Some((prefix.clone(), None));
                    listing.common_prefixes.push(prefix);
                }
                Emit::Object(_) => {
                    let mut skip_through = None;
                    if let Some(marker) = key_marker {
                        if key.as_str() < marker {
                            continue;
                        }
                        if key == marker {
                            match version_marker {
                                None => continue,
                                Some(version) => skip_through = Some(version),
                            }
                        }
                    }
                    let latest = versions.len().saturating_sub(1);
                    for (index, version) in versions.iter().enumerate().rev() {
                        if let Some(marker) = skip_through {
                            if version.version_id.as_deref() == Some(marker) {
                                skip_through = None;
                            }
                            continue;
                        }
                        if listing.versions.len() + listing.common_prefixes.len() == max_keys {
                            listing.is_truncated = true;
                            break 'keys;
                        }
                        last = Some((key.clone(), version.version_id.clone()));
                        listing.versions.push(VersionEntry {
                            key: key.clone(),
                            version_id: version.version_id.clone(),
                            size: version.body.as_ref().map_or(0, |body| body.len() as u64),
                            last_modified: version.modified,
                            is_latest: index == latest,
                            is_delete_marker: version.body.is_none(),
                        });
                    }
                }
            }
        }
        if listing.is_truncated
            && let Some((key, version)) = last
        {
            listing.next_key_marker = Some(key);
            listing.next_version_id_marker = version;
        }
        Ok(listing)
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.counters.put_object.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if lock(&self.failing_puts).contains(key) {
            return Err(connection_reset("PutObject"));
        }
        let mut inner = lock(&self.inner);
        let modified = inner.tick();
        inner.store(self.versioning, key.to_string(), Some(body), modified);
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        self.counters.create_multipart.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if lock(&self.failing_puts).contains(key) {
            return Err(connection_reset("CreateMultipartUpload"));
        }
        let mut inner = lock(&self.inner);
        inner.next_upload += 1;
        let upload_id = format!("upload-{}", inner.next_upload);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        self.counters.upload_part.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(
            &self.counters.parts_in_flight,
            &self.counters.peak_parts_in_flight,
        );
        self.delay().await;
        let mut inner = lock(&self.inner);
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| service_error("UploadPart", "NoSuchUpload", upload_id))?;
        upload.parts.insert(part_number, body);
        Ok(CompletedPart {
            part_number,
            etag: format!("\"{upload_id}-{part_number}\""),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        self.counters.complete_multipart.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let mut inner = lock(&self.inner);
        let upload = inner
            .uploads
            .remove(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| service_error("CompleteMultipartUpload", "NoSuchUpload", upload_id))?;
        let mut body = Vec::new();
        for part in &parts {
            let chunk = upload.parts.get(&part.part_number).ok_or_else(|| {
                service_error(
                    "CompleteMultipartUpload",
                    "InvalidPart",
                    format!("part {} was never uploaded", part.part_number),
                )
            })?;
            body.extend_from_slice(chunk);
        }
        let modified = inner.tick();
        inner.store(self.versioning, key.to_string(), Some(Bytes::from(body)), modified);
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.counters.abort_multipart.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner).uploads.remove(upload_id);
        Ok(())
    }

    async fn delete_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StorageError> {
        self.counters.delete_object.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(
            &self.counters.deletes_in_flight,
            &self.counters.peak_deletes_in_flight,
        );
        self.delay().await;
        if lock(&self.failing_deletes).contains(key) {
            return Err(service_error("DeleteObject", "AccessDenied", "Access Denied"));
        }
        let mut inner = lock(&self.inner);
        match version_id {
            Some(version_id) => {
                if let Some(versions) = inner.objects.get_mut(key) {
                    versions.retain(|v| v.version_id.as_deref() != Some(version_id));
                    if versions.is_empty() {
                        inner.objects.remove(key);
                    }
                }
            }
            None => {
                let modified = inner.tick();
                inner.store(self.versioning, key.to_string(), None, modified);
            }
        }
        Ok(())
    }

    async fn copy_object(
        &self,
        source_key: &str,
        source_version_id: Option<&str>,
        dest_key: &str,
    ) -> Result<(), StorageError> {
        self.counters.copy_object.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let mut inner = lock(&self.inner);
        let body = inner
            .objects
            .get(source_key)
            .and_then(|versions| match source_version_id {
                Some(id) => versions.iter().find(|v| v.version_id.as_deref() == Some(id)),
                None => versions.last(),
            })
            .and_then(|version| version.body.clone())
            .ok_or_else(|| service_error("CopyObject", "NoSuchKey", source_key))?;
        let modified = inner.tick();
        inner.store(self.versioning, dest_key.to_string(), Some(body), modified);
        Ok(())
    }

    async fn presign_get(
        &self,
        key: &str,
        version_id: Option<&str>,
        expires_in: Duration,
    ) -> Result<Url, StorageError> {
        let base = lock(&self.presign_base)
            .clone()
            .map_or_else(|| Url::parse("memory://storage/"), Ok)?;
        let mut url = base.join(&format!("{}/", self.bucket))?.join(key)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("expires", &expires_in.as_secs().to_string());
            if let Some(version_id) = version_id {
                query.append_pair("versionId", version_id);
            }
        }
        Ok(url)
    }
}
