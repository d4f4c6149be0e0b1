use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region, RequestChecksumCalculation};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, MetadataDirective,
};
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::storage::{
    CompletedPart, ListObjectsRequest, ListVersionsRequest, ObjectEntry, ObjectListing,
    ObjectStorage, VersionEntry, VersionListing,
};

const DEFAULT_REGION: &str = "us-east-1";
const CREDENTIALS_PROVIDER: &str = "bucketview";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{operation} failed: {message}")]
    Service {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },
    #[error("{operation} request failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("missing configuration value {0}")]
    Config(&'static str),
    #[error("response missing {0}")]
    MissingField(&'static str),
    #[error("presign failed: {0}")]
    Presign(String),
}

impl StorageError {
    pub fn code(&self) -> Option<&str> {
        match self {
            StorageError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub force_path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, StorageError> {
        let bucket = read_env("BUCKETVIEW_BUCKET").ok_or(StorageError::Config("BUCKETVIEW_BUCKET"))?;
        let access_key =
            read_env("BUCKETVIEW_ACCESS_KEY").ok_or(StorageError::Config("BUCKETVIEW_ACCESS_KEY"))?;
        let secret_key =
            read_env("BUCKETVIEW_SECRET_KEY").ok_or(StorageError::Config("BUCKETVIEW_SECRET_KEY"))?;
        let endpoint = read_env("BUCKETVIEW_ENDPOINT");
        let force_path_style = read_env("BUCKETVIEW_FORCE_PATH_STYLE")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(endpoint.is_some());
        Ok(Self {
            endpoint,
            region: read_env("BUCKETVIEW_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket,
            access_key,
            secret_key,
            force_path_style,
        })
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// S3 (and S3-compatible gateway) backend.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                CREDENTIALS_PROVIDER,
            ))
            .force_path_style(config.force_path_style)
            // Gateways commonly reject streaming checksum trailers.
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired);
        if let Some(endpoint) = &config.endpoint {
            let endpoint = Url::parse(endpoint)?;
            builder = builder.endpoint_url(endpoint.as_str().trim_end_matches('/'));
        }
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    fn copy_source(&self, key: &str, version_id: Option<&str>) -> String {
        let mut source = format!("{}/{}", self.bucket, encode_key(key));
        if let Some(version_id) = version_id {
            source.push_str("?versionId=");
            source.push_str(&encode_segment(version_id));
        }
        source
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(
        &self,
        request: ListObjectsRequest,
    ) -> Result<ObjectListing, StorageError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(request.prefix)
            .set_delimiter(request.delimiter)
            .set_continuation_token(request.continuation_token)
            .set_max_keys(request.max_keys.map(clamp_max_keys))
            .send()
            .await
            .map_err(|err| sdk_error("ListObjectsV2", err))?;

        let objects = output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|object| {
                Some(ObjectEntry {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: to_offset(object.last_modified()),
                    etag: object.e_tag().map(str::to_owned),
                })
            })
            .collect();
        let common_prefixes = output
            .common_prefixes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|prefix| prefix.prefix().map(str::to_owned))
            .collect();

        Ok(ObjectListing {
            objects,
            common_prefixes,
            next_continuation_token: output.next_continuation_token,
            is_truncated: output.is_truncated.unwrap_or(false),
        })
    }

    async fn list_object_versions(
        &self,
        request: ListVersionsRequest,
    ) -> Result<VersionListing, StorageError> {
        let output = self
            .client
            .list_object_versions()
            .bucket(&self.bucket)
            .prefix(request.prefix)
            .set_delimiter(request.delimiter)
            .set_key_marker(request.key_marker)
            .set_version_id_marker(request.version_id_marker)
            .set_max_keys(request.max_keys.map(clamp_max_keys))
            .send()
            .await
            .map_err(|err| sdk_error("ListObjectVersions", err))?;

        let mut versions: Vec<VersionEntry> = output
            .versions
            .unwrap_or_default()
            .into_iter()
            .filter_map(|version| {
                Some(VersionEntry {
                    key: version.key()?.to_string(),
                    version_id: version.version_id().map(str::to_owned),
                    size: version.size().unwrap_or(0).max(0) as u64,
                    last_modified: to_offset(version.last_modified()),
                    is_latest: version.is_latest().unwrap_or(false),
                    is_delete_marker: false,
                })
            })
            .collect();
        versions.extend(
            output
                .delete_markers
                .unwrap_or_default()
                .into_iter()
                .filter_map(|marker| {
                    Some(VersionEntry {
                        key: marker.key()?.to_string(),
                        version_id: marker.version_id().map(str::to_owned),
                        size: 0,
                        last_modified: to_offset(marker.last_modified()),
                        is_latest: marker.is_latest().unwrap_or(false),
                        is_delete_marker: true,
                    })
                }),
        );
        let common_prefixes = output
            .common_prefixes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|prefix| prefix.prefix().map(str::to_owned))
            .collect();

        Ok(VersionListing {
            versions,
            common_prefixes,
            next_key_marker: output.next_key_marker,
            next_version_id_marker: output.next_version_id_marker,
            is_truncated: output.is_truncated.unwrap_or(false),
        })
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error("PutObject", err))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| sdk_error("CreateMultipartUpload", err))?;
        output
            .upload_id()
            .map(str::to_owned)
            .ok_or(StorageError::MissingField("UploadId"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error("UploadPart", err))?;
        let etag = output
            .e_tag()
            .map(str::to_owned)
            .ok_or(StorageError::MissingField("ETag"))?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .build()
            })
            .collect::<Vec<_>>();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| sdk_error("CompleteMultipartUpload", err))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|err| sdk_error("AbortMultipartUpload", err))?;
        Ok(())
    }

    async fn delete_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_owned))
            .send()
            .await
            .map_err(|err| sdk_error("DeleteObject", err))?;
        Ok(())
    }

    async fn copy_object(
        &self,
        source_key: &str,
        source_version_id: Option<&str>,
        dest_key: &str,
    ) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(dest_key)
            .copy_source(self.copy_source(source_key, source_version_id))
            .metadata_directive(MetadataDirective::Replace)
            .send()
            .await
            .map_err(|err| sdk_error("CopyObject", err))?;
        Ok(())
    }

    async fn presign_get(
        &self,
        key: &str,
        version_id: Option<&str>,
        expires_in: Duration,
    ) -> Result<Url, StorageError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|err| StorageError::Presign(err.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_owned))
            .presigned(presigning)
            .await
            .map_err(|err| sdk_error("GetObject", err))?;
        Ok(Url::parse(request.uri())?)
    }
}

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service) => {
            let inner = service.err();
            StorageError::Service {
                operation,
                code: inner.code().map(str::to_owned),
                message: inner
                    .message()
                    .map(str::to_owned)
                    .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
            }
        }
        _ => StorageError::Transport {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

fn clamp_max_keys(value: u32) -> i32 {
    value.min(i32::MAX as u32) as i32
}

fn to_offset(value: Option<&DateTime>) -> OffsetDateTime {
    value
        .and_then(|value| {
            let nanos = i128::from(value.secs()) * 1_000_000_000 + i128::from(value.subsec_nanos());
            OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
        })
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
