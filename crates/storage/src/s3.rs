//! S3 storage backend
//!
//! A backend is rooted at an `s3://<bucket>/<root>/` location. Keys handed to
//! it are relative to that root, the same keys [`BackendTransfer`] derives
//! from local paths, so an uploaded run directory keeps its layout and can be
//! downloaded again under the same prefix.
//!
//! Requests are made once. Retrying belongs to the caller's [`RetryConfig`],
//! so the SDK's own retry layer is disabled.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::retry::RetryConfig as SdkRetryConfig;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use run_core::{Error, Result, RetryConfig};
use tracing::{debug, instrument, warn};

use crate::{BackendTransfer, StorageBackend};

/// Payloads above this size are sent as multipart uploads
const MULTIPART_THRESHOLD: usize = 16 * 1024 * 1024;

/// Multipart part size; S3 requires at least 5 MiB for all but the last part
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Bucket plus key root, parsed from `s3://bucket/some/root/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,

    /// Empty, or a key prefix ending in `/`
    pub root: String,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>, root: &str) -> Self {
        let root = root.trim_matches('/');
        Self {
            bucket: bucket.into(),
            root: if root.is_empty() {
                String::new()
            } else {
                format!("{}/", root)
            },
        }
    }

    /// Parse an `s3://bucket[/root]` URI
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix("s3://").ok_or_else(|| invalid_location(uri, "scheme must be s3://"))?;
        let (bucket, root) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid_location(uri, "missing bucket"));
        }
        Ok(Self::new(bucket, root))
    }

    /// Full object key for a backend-relative key
    pub fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.root, key)
    }

    /// Backend-relative key for a full object key under this root
    pub fn relative_key<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        object_key.strip_prefix(self.root.as_str())
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.root)
    }
}

/// Static access keys, e.g. for MinIO
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub location: S3Location,

    /// Custom endpoint (MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    pub region: String,

    /// Path-style addressing, required by most S3-compatible servers
    pub force_path_style: bool,

    /// Falls back to the default AWS credential chain when unset
    pub credentials: Option<S3Credentials>,
}

impl S3Config {
    pub fn new(location: S3Location) -> Self {
        Self {
            location,
            endpoint_url: None,
            region: "us-east-1".to_string(),
            force_path_style: false,
            credentials: None,
        }
    }

    /// Config for an S3-compatible server at `endpoint`
    pub fn compatible(location: S3Location, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint_url: Some(endpoint.into()),
            force_path_style: true,
            ..Self::new(location)
        }
    }
}

/// [`StorageBackend`] over an S3 bucket
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    location: S3Location,
}

impl S3Storage {
    pub async fn connect(config: S3Config) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&shared)
            .retry_config(SdkRetryConfig::disabled())
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(creds) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                None,
                None,
                "run-config",
            ));
        }

        debug!(location = %config.location, endpoint = ?config.endpoint_url, "Connected S3 backend");
        Self {
            client: Client::from_conf(builder.build()),
            location: config.location,
        }
    }

    pub fn location(&self) -> &S3Location {
        &self.location
    }

    /// Directory transfer over this bucket with the given retry policy
    pub fn into_transfer(self, retry: RetryConfig) -> BackendTransfer {
        BackendTransfer::with_retry(Arc::new(self), retry)
    }

    async fn put_multipart(&self, object_key: &str, data: Bytes) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.location.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| request_failed("create_multipart_upload", object_key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::storage(format!("no upload id returned for {}", object_key)))?
            .to_string();

        match self.upload_parts(object_key, &upload_id, &data).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.location.bucket)
                    .key(object_key)
                    .upload_id(&upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map_err(|e| request_failed("complete_multipart_upload", object_key, e))?;
                Ok(())
            }
            Err(e) => {
                let aborted = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.location.bucket)
                    .key(object_key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort) = aborted {
                    warn!(%object_key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, object_key: &str, upload_id: &str, data: &Bytes) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        for (index, start) in (0..data.len()).step_by(PART_SIZE).enumerate() {
            let end = (start + PART_SIZE).min(data.len());
            let part_number = index as i32 + 1;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.location.bucket)
                .key(object_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.slice(start..end)))
                .send()
                .await
                .map_err(|e| request_failed("upload_part", object_key, e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(String::from))
                    .build(),
            );
        }
        debug!(%object_key, parts = parts.len(), "Uploaded parts");
        Ok(parts)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    #[instrument(skip(self), fields(backend = "s3", location = %self.location))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let object_key = self.location.object_key(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.location.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    Error::StoragePathNotFound { path: path.to_string() }
                } else {
                    request_failed("get_object", &object_key, e)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| Error::storage(format!("reading body of {} failed: {}", object_key, e)))?;
        Ok(body.into_bytes())
    }

    #[instrument(skip(self, data), fields(backend = "s3", location = %self.location, size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let object_key = self.location.object_key(path);
        let size = data.len() as u64;

        if data.len() > MULTIPART_THRESHOLD {
            self.put_multipart(&object_key, data).await?;
        } else {
            self.client
                .put_object()
                .bucket(&self.location.bucket)
                .key(&object_key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| request_failed("put_object", &object_key, e))?;
        }
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "s3", location = %self.location))]
    async fn delete(&self, path: &str) -> Result<()> {
        let object_key = self.location.object_key(path);
        self.client
            .delete_object()
            .bucket(&self.location.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| request_failed("delete_object", &object_key, e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", location = %self.location))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let object_key = self.location.object_key(path);
        match self
            .client
            .head_object()
            .bucket(&self.location.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
            Err(e) => Err(request_failed("head_object", &object_key, e)),
        }
    }

    /// Keys under `prefix`, relative to the location root, following
    /// continuation tokens until the listing is complete
    #[instrument(skip(self), fields(backend = "s3", location = %self.location))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let object_prefix = self.location.object_key(prefix);
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.location.bucket)
                .prefix(&object_prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| request_failed("list_objects_v2", &object_prefix, e))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| !key.ends_with('/'))
                    .filter_map(|key| self.location.relative_key(key))
                    .map(String::from),
            );

            match page.next_continuation_token() {
                Some(next) if page.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }

        keys.sort();
        debug!(%object_prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

fn request_failed<E>(operation: &str, object_key: &str, error: E) -> Error
where
    E: std::error::Error,
{
    Error::storage(format!(
        "S3 {} for {} failed: {}",
        operation,
        object_key,
        DisplayErrorContext(&error)
    ))
}

fn invalid_location(uri: &str, reason: &str) -> Error {
    Error::config(format!("invalid S3 location {:?}: {}", uri, reason))
}
