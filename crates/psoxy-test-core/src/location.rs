//! Async responses: a 202 with a `Location` pointing at a bucket object that
//! will hold the real response once the proxy is done.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;
use url::Url;

use crate::error::{HarnessError, HarnessResult};
use crate::provider::ProxyClient;
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::types::{CallOptions, Provider};

/// Polling for async results: every 10s, up to two minutes.
pub const ASYNC_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 12,
    delay: Duration::from_secs(10),
};

/// Bucket object named by a `Location` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub provider: Provider,
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.provider {
            Provider::Aws => "s3",
            Provider::Gcp => "gs",
        };
        write!(f, "{}://{}/{}", scheme, self.bucket, self.key)
    }
}

fn unsupported(input: &str) -> HarnessError {
    HarnessError::config(format!(
        "unsupported storage URL: {}. Only S3, GCS, and their HTTPS URLs are supported",
        input
    ))
}

fn split_bucket_key(rest: &str) -> Option<(String, String)> {
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket.to_string(), key.to_string()))
}

impl FromStr for ObjectLocation {
    type Err = HarnessError;

    /// `s3://b/k`, `gs://b/k`, `https://b.s3[.region].amazonaws.com/k`,
    /// `https://s3[.region].amazonaws.com/b/k`, `https://storage.googleapis.com/b/k`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        for (scheme, provider) in [("s3://", Provider::Aws), ("gs://", Provider::Gcp)] {
            if let Some(rest) = input.strip_prefix(scheme) {
                let (bucket, key) = split_bucket_key(rest).ok_or_else(|| unsupported(input))?;
                return Ok(Self {
                    provider,
                    bucket,
                    key,
                });
            }
        }

        let url = Url::parse(input).map_err(|_| unsupported(input))?;
        let host = url.host_str().ok_or_else(|| unsupported(input))?;
        let path = url.path().trim_start_matches('/');

        if host == "storage.googleapis.com" {
            let (bucket, key) = split_bucket_key(path).ok_or_else(|| unsupported(input))?;
            return Ok(Self {
                provider: Provider::Gcp,
                bucket,
                key,
            });
        }

        if host.ends_with(".amazonaws.com") {
            if host.starts_with("s3.") || host.starts_with("s3-") {
                let (bucket, key) = split_bucket_key(path).ok_or_else(|| unsupported(input))?;
                return Ok(Self {
                    provider: Provider::Aws,
                    bucket,
                    key,
                });
            }
            if let Some((bucket, _)) = host.split_once(".s3") {
                if !bucket.is_empty() && !path.is_empty() {
                    return Ok(Self {
                        provider: Provider::Aws,
                        bucket: bucket.to_string(),
                        key: path.to_string(),
                    });
                }
            }
        }

        Err(unsupported(input))
    }
}

/// Wait for the object behind `location` and return its decompressed text.
pub async fn poll_async_response(
    client: &ProxyClient,
    location: &str,
    options: &CallOptions,
    policy: &RetryPolicy,
) -> HarnessResult<String> {
    let target: ObjectLocation = location.parse()?;
    info!(location = %location, "Polling for async response");

    let store = client
        .bucket_store(target.provider, options.role.as_deref(), options.region.as_deref())
        .await?;

    let progress = format!("Waiting for async response at {}", target);
    let object = execute_with_retry(
        policy,
        &progress,
        || {
            let store = &store;
            let target = &target;
            async move { store.get(&target.bucket, &target.key).await.map(Some) }
        },
        |e: &HarnessError| !e.is_retryable(),
    )
    .await
    .map_err(|e| e.into_harness_error(target.to_string()))?;

    info!(location = %target, "Async response found");
    Ok(object.decoded_text())
}
