//! Object storage used by bulk round-trips, async responses and webhook
//! verification.
//!
//! Buckets are reached through `object_store`: S3 and GCS for real
//! deployments, an in-memory store where nothing leaves the process.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::{GcpCredential, GoogleCloudStorageBuilder};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, ClientOptions, ObjectStore, ObjectStoreExt, PutOptions, PutPayload,
    StaticCredentialProvider,
};
use tracing::debug;

use crate::credentials::AwsCredentials;
use crate::error::{HarnessError, HarnessResult};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::transport::{gunzip, inflate, is_gzip};

/// Downloaded object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredObject {
    pub content: Vec<u8>,
    pub content_encoding: Option<String>,
}

impl StoredObject {
    pub fn is_gzip(&self) -> bool {
        is_gzip(&self.content)
            || self
                .content_encoding
                .as_deref()
                .map(|e| e.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false)
    }

    /// Content with gzip undone when the magic bytes or encoding say so.
    ///
    /// Falls back to the raw bytes when the content turns out not to be
    /// compressed (storage may already have transcoded it).
    pub fn decoded(&self) -> Vec<u8> {
        if self.is_gzip() {
            match gunzip(&self.content).or_else(|_| inflate(&self.content)) {
                Ok(bytes) => return bytes,
                Err(e) => debug!(error = %e, "content flagged as gzip but not decodable, using raw bytes"),
            }
        }
        self.content.clone()
    }

    pub fn decoded_text(&self) -> String {
        String::from_utf8_lossy(&self.decoded()).into_owned()
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Where buckets live and how to authenticate against them.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    S3 {
        credentials: AwsCredentials,
        region: String,
        /// Path-style endpoint override (emulators, tests).
        endpoint: Option<String>,
    },
    Gcs {
        /// OAuth access token, never the proxy identity token.
        access_token: String,
        endpoint: Option<String>,
    },
    /// One shared in-memory store; each bucket is a top-level prefix.
    Memory(Arc<InMemory>),
}

/// Bucket operations on top of `object_store`.
///
/// Each S3/GCS bucket gets its own client, built on demand.
#[derive(Debug, Clone)]
pub struct BucketStore {
    backend: StorageBackend,
}

impl BucketStore {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageBackend::Memory(Arc::new(InMemory::new())))
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    fn client(&self, bucket: &str) -> HarnessResult<Arc<dyn ObjectStore>> {
        let built = match &self.backend {
            StorageBackend::Memory(store) => return Ok(store.clone() as Arc<dyn ObjectStore>),
            StorageBackend::S3 {
                credentials,
                region,
                endpoint,
            } => {
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region)
                    .with_access_key_id(&credentials.access_key_id)
                    .with_secret_access_key(&credentials.secret_access_key);
                if let Some(token) = &credentials.session_token {
                    builder = builder.with_token(token);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                builder.build().map(|s3| Arc::new(s3) as Arc<dyn ObjectStore>)
            }
            StorageBackend::Gcs {
                access_token,
                endpoint,
            } => {
                let credentials = Arc::new(StaticCredentialProvider::new(GcpCredential {
                    bearer: access_token.clone(),
                }));
                let mut builder = GoogleCloudStorageBuilder::new()
                    .with_bucket_name(bucket)
                    .with_credentials(credentials);
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_base_url(endpoint.trim_end_matches('/'))
                        .with_client_options(ClientOptions::new().with_allow_http(true));
                }
                builder.build().map(|gcs| Arc::new(gcs) as Arc<dyn ObjectStore>)
            }
        };
        built.map_err(|e| HarnessError::Storage {
            bucket: bucket.to_string(),
            message: e.to_string(),
        })
    }

    /// Object path inside the client returned by [`Self::client`].
    fn path(&self, bucket: &str, key: &str) -> Path {
        match self.backend {
            StorageBackend::Memory(_) => Path::from(format!("{}/{}", bucket, key)),
            _ => Path::from(key),
        }
    }

    /// Upload `content`; encoding and content type are derived from it.
    pub async fn put(&self, bucket: &str, key: &str, content: Vec<u8>) -> HarnessResult<()> {
        let client = self.client(bucket)?;
        let options = PutOptions {
            attributes: upload_attributes(key, &content),
            ..Default::default()
        };
        debug!(bucket = %bucket, key = %key, size = content.len(), "uploading object");
        client
            .put_opts(&self.path(bucket, key), PutPayload::from(content), options)
            .await
            .map_err(|e| storage_error(bucket, key, e))?;
        Ok(())
    }

    /// `HarnessError::ObjectNotFound` when the key does not exist.
    pub async fn get(&self, bucket: &str, key: &str) -> HarnessResult<StoredObject> {
        let client = self.client(bucket)?;
        let result = client
            .get(&self.path(bucket, key))
            .await
            .map_err(|e| storage_error(bucket, key, e))?;
        let content_encoding = result
            .attributes
            .get(&Attribute::ContentEncoding)
            .map(|v| v.to_string());
        let content = result
            .bytes()
            .await
            .map_err(|e| storage_error(bucket, key, e))?;

        Ok(StoredObject {
            content: content.to_vec(),
            content_encoding,
        })
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> HarnessResult<()> {
        let client = self.client(bucket)?;
        client
            .delete(&self.path(bucket, key))
            .await
            .map_err(|e| storage_error(bucket, key, e))
    }

    /// Every object in `bucket`.
    pub async fn list(&self, bucket: &str) -> HarnessResult<Vec<ObjectSummary>> {
        let client = self.client(bucket)?;
        let prefix = match self.backend {
            StorageBackend::Memory(_) => Some(Path::from(bucket)),
            _ => None,
        };
        let entries: Vec<_> = client
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(|e| storage_error(bucket, "", e))?;

        let strip = format!("{}/", bucket);
        Ok(entries
            .into_iter()
            .map(|meta| {
                let location = meta.location.as_ref();
                let key = match prefix {
                    Some(_) => location.strip_prefix(&strip).unwrap_or(location),
                    None => location,
                };
                ObjectSummary {
                    key: key.to_string(),
                    last_modified: meta.last_modified,
                }
            })
            .collect())
    }
}

fn storage_error(bucket: &str, key: &str, err: object_store::Error) -> HarnessError {
    match err {
        object_store::Error::NotFound { .. } => HarnessError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        other => HarnessError::Storage {
            bucket: bucket.to_string(),
            message: other.to_string(),
        },
    }
}

/// Upload metadata for an object: (content type, content encoding).
pub fn upload_metadata(key: &str, content: &[u8]) -> (Option<&'static str>, Option<&'static str>) {
    let content_type = key
        .to_ascii_lowercase()
        .ends_with(".csv")
        .then_some("text/csv");
    let content_encoding = is_gzip(content).then_some("gzip");
    (content_type, content_encoding)
}

fn upload_attributes(key: &str, content: &[u8]) -> Attributes {
    let mut attributes = Attributes::new();
    let (content_type, content_encoding) = upload_metadata(key, content);
    if let Some(content_type) = content_type {
        attributes.insert(Attribute::ContentType, content_type.into());
    }
    if let Some(content_encoding) = content_encoding {
        attributes.insert(Attribute::ContentEncoding, content_encoding.into());
    }
    attributes
}

/// Download `key`, waiting for it to appear.
///
/// Only `ObjectNotFound` is retried; any other error ends the wait at once.
pub async fn download_with_retry(
    store: &BucketStore,
    bucket: &str,
    key: &str,
    policy: &RetryPolicy,
) -> HarnessResult<StoredObject> {
    let progress = format!("Waiting for {}/{}", bucket, key);
    execute_with_retry(
        policy,
        &progress,
        || async move { store.get(bucket, key).await.map(Some) },
        |e: &HarnessError| !matches!(e, HarnessError::ObjectNotFound { .. }),
    )
    .await
    .map_err(|e| e.into_harness_error(format!("{}/{}", bucket, key)))
}

/// Objects modified after `since`, newest first.
pub async fn list_newer_than(
    store: &BucketStore,
    bucket: &str,
    since: DateTime<Utc>,
) -> HarnessResult<Vec<ObjectSummary>> {
    let mut objects: Vec<ObjectSummary> = store
        .list(bucket)
        .await?
        .into_iter()
        .filter(|o| o.last_modified > since)
        .collect();
    objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    Ok(objects)
}
