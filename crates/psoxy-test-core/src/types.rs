//! Option structs handed to the core by the CLI layer.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{HarnessError, HarnessResult};
use crate::retry::RetryPolicy;

/// Default timeout for proxy calls; serverless cold starts can take 20s+.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

/// Cloud hosting the proxy deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
}

impl Provider {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            other => Err(HarnessError::config(format!(
                "unknown provider \"{}\": expected aws or gcp",
                other
            ))),
        }
    }
}

/// Reference to an asymmetric key used to sign identity JWTs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKeyRef {
    /// `aws-kms:<key arn>`
    AwsKms(String),
    /// `gcp-kms:projects/../cryptoKeys/<key>`
    GcpKms(String),
}

impl SigningKeyRef {
    pub const AWS_PREFIX: &'static str = "aws-kms:";
    pub const GCP_PREFIX: &'static str = "gcp-kms:";

    /// Key identifier without the scheme prefix; used as JWT `kid`.
    pub fn key_id(&self) -> &str {
        match self {
            Self::AwsKms(arn) => arn,
            Self::GcpKms(path) => path,
        }
    }
}

impl FromStr for SigningKeyRef {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(arn) = s.strip_prefix(Self::AWS_PREFIX) {
            if !arn.is_empty() {
                return Ok(Self::AwsKms(arn.to_string()));
            }
        } else if let Some(path) = s.strip_prefix(Self::GCP_PREFIX) {
            if !path.is_empty() {
                return Ok(Self::GcpKms(path.to_string()));
            }
        }
        Err(HarnessError::config(format!(
            "invalid signing key \"{}\": expected aws-kms:<arn> or gcp-kms:<key-id>",
            s
        )))
    }
}

impl fmt::Display for SigningKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwsKms(arn) => write!(f, "{}{}", Self::AWS_PREFIX, arn),
            Self::GcpKms(path) => write!(f, "{}{}", Self::GCP_PREFIX, path),
        }
    }
}

/// Options for a single proxy call (or the base options of a graph walk).
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub url: Url,
    pub method: Option<Method>,
    pub body: Option<Value>,
    pub force: Option<Provider>,
    pub impersonate: Option<String>,
    pub role: Option<String>,
    pub region: Option<String>,
    pub token: Option<String>,
    pub skip: bool,
    pub gzip: bool,
    pub health_check: bool,
    pub request_no_response: bool,
    pub async_processing: bool,
    pub signing_key: Option<SigningKeyRef>,
    pub identity_issuer: Option<String>,
    pub identity_subject: Option<String>,
    pub verbose: bool,
    pub save_to_file: bool,
    pub data_source: Option<String>,
    pub verify_collection: Option<String>,
    pub scheduler_job: Option<String>,
    pub timeout: Duration,
}

impl CallOptions {
    /// Options for `url` with every flag at its default.
    pub fn new(url: &str) -> HarnessResult<Self> {
        let url = Url::parse(url).map_err(|_| HarnessError::InvalidUrl {
            input: url.to_string(),
        })?;

        Ok(Self {
            url,
            method: None,
            body: None,
            force: None,
            impersonate: None,
            role: None,
            region: None,
            token: None,
            skip: false,
            gzip: true,
            health_check: false,
            request_no_response: false,
            async_processing: false,
            signing_key: None,
            identity_issuer: None,
            identity_subject: None,
            verbose: false,
            save_to_file: false,
            data_source: None,
            verify_collection: None,
            scheduler_job: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Set the request body from a JSON string.
    pub fn with_body_json(mut self, body: &str) -> HarnessResult<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| HarnessError::config(format!("body is not valid JSON: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_force(mut self, provider: Provider) -> Self {
        self.force = Some(provider);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_impersonate(mut self, user: impl Into<String>) -> Self {
        self.impersonate = Some(user.into());
        self
    }

    pub fn with_signing_key(mut self, key: SigningKeyRef) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn with_identity(mut self, issuer: impl Into<String>, subject: Option<String>) -> Self {
        self.identity_issuer = Some(issuer.into());
        self.identity_subject = subject;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same options pointed at another URL (used by the graph walker).
    pub fn for_url(&self, url: Url) -> Self {
        Self {
            url,
            ..self.clone()
        }
    }

    /// Cross-field checks that must hold before any network call.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.signing_key.is_some()
            && self
                .identity_issuer
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
        {
            return Err(HarnessError::config(
                "--identity-issuer is required when --signing-key is set",
            ));
        }

        if self.verify_collection.is_some() && self.body.is_none() {
            return Err(HarnessError::config(
                "--verify-collection needs --body: it is the content to look for",
            ));
        }

        Ok(())
    }
}

/// Bucket name plus optional prefix, from a `bucket/prefix` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLocation {
    pub bucket: String,
    pub prefix: String,
}

impl BucketLocation {
    /// Split on the first `/`.
    pub fn parse(option: &str) -> Self {
        match option.split_once('/') {
            Some((bucket, prefix)) => Self {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            },
            None => Self {
                bucket: option.to_string(),
                prefix: String::new(),
            },
        }
    }

    /// Object key for `name` inside this location.
    pub fn key_for(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), name)
        }
    }
}

/// Options for a bulk upload/sanitize/download round-trip.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub provider: Provider,
    pub file: PathBuf,
    pub input: BucketLocation,
    pub output: BucketLocation,
    pub role: Option<String>,
    pub region: Option<String>,
    /// Delete the sanitized object from the output bucket afterwards.
    pub delete_output: bool,
    /// Keep a local copy of the sanitized file next to the original.
    pub save_sanitized: bool,
    pub retry: RetryPolicy,
}

impl UploadOptions {
    pub fn new(provider: Provider, file: impl Into<PathBuf>, input: &str, output: &str) -> Self {
        Self {
            provider,
            file: file.into(),
            input: BucketLocation::parse(input),
            output: BucketLocation::parse(output),
            role: None,
            region: None,
            delete_output: false,
            save_sanitized: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Options for async/webhook collection verification.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub bucket: String,
    pub expected: Value,
    pub started_at: DateTime<Utc>,
    pub scheduler_job: Option<String>,
    pub timeout: Duration,
    pub interval: Duration,
}

impl VerifyOptions {
    pub const AWS_TIMEOUT: Duration = Duration::from_secs(90);
    pub const GCP_TIMEOUT: Duration = Duration::from_secs(60);
    pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(
        provider: Provider,
        bucket: impl Into<String>,
        expected: Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        let timeout = match provider {
            Provider::Aws => Self::AWS_TIMEOUT,
            Provider::Gcp => Self::GCP_TIMEOUT,
        };
        Self {
            bucket: bucket.into(),
            expected,
            started_at,
            scheduler_job: None,
            timeout,
            interval: Self::POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_fails_fast() {
        let err = CallOptions::new("not a url").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidUrl { .. }));
        assert!(err.to_string().contains("not a url"));
    }

    #[test]
    fn test_invalid_body_names_input() {
        let err = CallOptions::new("https://abc.lambda-url.us-east-1.on.aws/")
            .unwrap()
            .with_body_json("{not json")
            .unwrap_err();
        assert!(err.to_string().contains("body is not valid JSON"));
    }

    #[test]
    fn test_signing_key_parse() {
        let key: SigningKeyRef = "aws-kms:arn:aws:kms:us-east-1:123:key/abc".parse().unwrap();
        assert_eq!(key, SigningKeyRef::AwsKms("arn:aws:kms:us-east-1:123:key/abc".into()));
        assert_eq!(key.key_id(), "arn:aws:kms:us-east-1:123:key/abc");

        let key: SigningKeyRef = "gcp-kms:projects/p/locations/l/keyRings/r/cryptoKeys/k"
            .parse()
            .unwrap();
        assert!(matches!(key, SigningKeyRef::GcpKms(_)));

        assert!("vault:abc".parse::<SigningKeyRef>().is_err());
        assert!("aws-kms:".parse::<SigningKeyRef>().is_err());
    }

    #[test]
    fn test_signing_key_requires_issuer() {
        let options = CallOptions::new("https://abc.lambda-url.us-east-1.on.aws/")
            .unwrap()
            .with_signing_key(SigningKeyRef::AwsKms("arn".into()));
        assert!(options.validate().is_err());

        let options = options.with_identity("https://issuer.example", None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_bucket_location_split_on_first_slash() {
        let location = BucketLocation::parse("input-bucket/some/path");
        assert_eq!(location.bucket, "input-bucket");
        assert_eq!(location.prefix, "some/path");
        assert_eq!(location.key_for("a.csv"), "some/path/a.csv");

        let location = BucketLocation::parse("input-bucket");
        assert_eq!(location.prefix, "");
        assert_eq!(location.key_for("a.csv"), "a.csv");
    }

    #[test]
    fn test_provider_from_str_case_insensitive() {
        assert_eq!("AWS".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("gcp".parse::<Provider>().unwrap(), Provider::Gcp);
        assert!("azure".parse::<Provider>().is_err());
    }
}
