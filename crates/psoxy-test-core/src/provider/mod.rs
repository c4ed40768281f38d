//! Provider detection and the proxy client.
//!
//! `ProxyClient::call` is the single place that picks AWS or GCP; everything
//! provider-specific lives in the `aws` and `gcp` submodules.

pub mod aws;
pub mod gcp;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::catalog::Catalog;
use crate::credentials::{AwsCredentialProvider, AwsCredentials, GcpTokenSource};
use crate::error::{HarnessError, HarnessResult};
use crate::jwt::{sign_jwt, AwsKmsSigner, GcpKmsSigner, JwtClaims, KmsSigner};
use crate::response::ProxyResponse;
use crate::sigv4::resolve_region;
use crate::storage::{BucketStore, StorageBackend};
use crate::transport::{Transport, USER_AGENT_VALUE};
use crate::types::{CallOptions, Provider, SigningKeyRef};

const AWS_HOST_SUFFIXES: [&str; 2] = [".amazonaws.com", ".on.aws"];
const GCP_GEN1_DOMAIN: &str = "cloudfunctions.net";
const GCP_GEN2_DOMAIN: &str = "run.app";

impl Provider {
    /// Provider hosting `url`, from its hostname.
    pub fn detect(url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        if AWS_HOST_SUFFIXES.iter().any(|s| host.ends_with(s)) {
            Some(Self::Aws)
        } else if host.ends_with(GCP_GEN1_DOMAIN) || host.ends_with(GCP_GEN2_DOMAIN) {
            Some(Self::Gcp)
        } else {
            None
        }
    }

    /// `--force` wins over detection.
    pub fn resolve(options: &CallOptions) -> HarnessResult<Self> {
        options
            .force
            .or_else(|| Self::detect(&options.url))
            .ok_or_else(|| HarnessError::UnknownProvider {
                url: options.url.to_string(),
            })
    }
}

/// Base URL overrides for cloud APIs (local emulators, tests).
#[derive(Debug, Clone, Default)]
pub struct CloudEndpoints {
    pub sts: Option<String>,
    pub aws_kms: Option<String>,
    pub s3: Option<String>,
    pub cloudwatch_logs: Option<String>,
    pub gcp_kms: Option<String>,
    pub gcs: Option<String>,
    pub cloud_logging: Option<String>,
    pub cloud_scheduler: Option<String>,
}

/// Calls proxy deployments and the cloud APIs around them.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    transport: Transport,
    catalog: Catalog,
    endpoints: CloudEndpoints,
    aws_credentials: Option<AwsCredentialProvider>,
    gcp_tokens: Option<GcpTokenSource>,
    bucket_store: Option<BucketStore>,
}

impl ProxyClient {
    pub fn new(transport: Transport, catalog: Catalog) -> Self {
        Self {
            transport,
            catalog,
            endpoints: CloudEndpoints::default(),
            aws_credentials: None,
            gcp_tokens: None,
            bucket_store: None,
        }
    }

    /// Use these credentials instead of role assumption / default chain.
    pub fn with_aws_credentials(mut self, provider: AwsCredentialProvider) -> Self {
        self.aws_credentials = Some(provider);
        self
    }

    /// Use this account instead of the ambient gcloud one.
    pub fn with_gcp_tokens(mut self, tokens: GcpTokenSource) -> Self {
        self.gcp_tokens = Some(tokens);
        self
    }

    /// Use this store for every bucket, whatever the provider.
    pub fn with_bucket_store(mut self, store: BucketStore) -> Self {
        self.bucket_store = Some(store);
        self
    }

    pub fn with_endpoints(mut self, endpoints: CloudEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn endpoints(&self) -> &CloudEndpoints {
        &self.endpoints
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        self.transport.client()
    }

    /// One authenticated proxy call.
    ///
    /// Credential and signing failures are errors; anything that happens on
    /// the wire comes back inside the response.
    pub async fn call(&self, options: &CallOptions) -> HarnessResult<ProxyResponse> {
        options.validate()?;
        let provider = Provider::resolve(options)?;
        debug!(provider = %provider, url = %options.url, "resolved provider");

        let transport = self.transport.clone().with_timeout(options.timeout);
        let (method, headers, body) = match provider {
            Provider::Aws => aws::prepare(self, options).await?,
            Provider::Gcp => gcp::prepare(self, options).await?,
        };

        info!(url = %options.url, "Calling Psoxy and waiting response");
        debug!(method = %method, headers = ?redact(&headers), "request prepared");

        Ok(transport.request(&options.url, &method, &headers, body).await)
    }

    /// Explicit method, else POST for a non-empty body, else the catalog's
    /// method for this exact path, else GET.
    pub fn resolve_method(&self, options: &CallOptions) -> Method {
        if let Some(method) = &options.method {
            return method.clone();
        }
        if options.body.as_ref().map(has_content).unwrap_or(false) {
            return Method::POST;
        }
        self.catalog
            .method_for_path(options.url.path())
            .unwrap_or(Method::GET)
    }

    pub(crate) fn aws_credential_provider(
        &self,
        role: Option<&str>,
        region: &str,
    ) -> AwsCredentialProvider {
        if let Some(provider) = &self.aws_credentials {
            return provider.clone();
        }
        match (AwsCredentialProvider::for_role(role, region), &self.endpoints.sts) {
            (AwsCredentialProvider::AssumeRole { role, region, .. }, Some(sts)) => {
                AwsCredentialProvider::AssumeRole {
                    role,
                    region,
                    sts_endpoint: sts.clone(),
                }
            }
            (provider, _) => provider,
        }
    }

    pub async fn aws_credentials(
        &self,
        role: Option<&str>,
        region: &str,
    ) -> HarnessResult<AwsCredentials> {
        self.aws_credential_provider(role, region)
            .credentials(self.http())
            .await
    }

    /// Ambient GCP account. `--token` never replaces it; it is only passed
    /// to [`GcpTokenSource::identity_token`] for proxy calls.
    pub fn gcp_tokens(&self) -> GcpTokenSource {
        self.gcp_tokens.clone().unwrap_or_else(GcpTokenSource::gcloud)
    }

    /// Storage backend for `provider`: `role`/`region` credentials on AWS,
    /// the ambient account's access token on GCP.
    pub(crate) async fn storage_backend(
        &self,
        provider: Provider,
        role: Option<&str>,
        region: Option<&str>,
    ) -> HarnessResult<StorageBackend> {
        Ok(match provider {
            Provider::Aws => {
                let region = region.unwrap_or(aws::DEFAULT_REGION);
                StorageBackend::S3 {
                    credentials: self.aws_credentials(role, region).await?,
                    region: region.to_string(),
                    endpoint: self.endpoints.s3.clone(),
                }
            }
            Provider::Gcp => StorageBackend::Gcs {
                access_token: self.gcp_tokens().access_token().await?,
                endpoint: self.endpoints.gcs.clone(),
            },
        })
    }

    /// Bucket store for `provider`.
    pub async fn bucket_store(
        &self,
        provider: Provider,
        role: Option<&str>,
        region: Option<&str>,
    ) -> HarnessResult<BucketStore> {
        if let Some(store) = &self.bucket_store {
            return Ok(store.clone());
        }
        let backend = self.storage_backend(provider, role, region).await?;
        Ok(BucketStore::new(backend))
    }

    /// RS256 identity token for `options`, signed by the configured KMS key.
    ///
    /// `aws_credentials` is reused for AWS KMS when the caller already has
    /// them.
    pub(crate) async fn identity_jwt(
        &self,
        key: &SigningKeyRef,
        options: &CallOptions,
        region: &str,
        aws_credentials: Option<&AwsCredentials>,
        now: DateTime<Utc>,
    ) -> HarnessResult<String> {
        let issuer = options
            .identity_issuer
            .as_deref()
            .ok_or_else(|| HarnessError::config("--identity-issuer is required when --signing-key is set"))?;
        let claims = JwtClaims::new(issuer, options.identity_subject.as_deref(), now);

        let signer: Box<dyn KmsSigner> = match key {
            SigningKeyRef::AwsKms(arn) => {
                let credentials = match aws_credentials {
                    Some(credentials) => credentials.clone(),
                    None => self.aws_credentials(options.role.as_deref(), region).await?,
                };
                let mut signer = AwsKmsSigner::new(self.http().clone(), arn, region, credentials);
                if let Some(endpoint) = &self.endpoints.aws_kms {
                    signer = signer.with_endpoint(endpoint.clone());
                }
                Box::new(signer)
            }
            SigningKeyRef::GcpKms(path) => {
                let mut signer = GcpKmsSigner::new(self.http().clone(), path, self.gcp_tokens());
                if let Some(endpoint) = &self.endpoints.gcp_kms {
                    signer = signer.with_endpoint(endpoint.clone());
                }
                Box::new(signer)
            }
        };

        debug!(key = %key, "signing identity token");
        sign_jwt(signer.as_ref(), &claims).await
    }

    /// Region for AWS calls: explicit option, else from the URL host.
    pub fn aws_region(options: &CallOptions) -> String {
        options
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| resolve_region(&options.url))
    }
}

/// Headers every proxy call carries, whatever the provider.
pub fn common_headers(options: &CallOptions) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        "Accept-Encoding".to_string(),
        if options.gzip { "gzip,deflate" } else { "*" }.to_string(),
    );
    headers.insert("X-Psoxy-Skip-Sanitizer".to_string(), options.skip.to_string());
    headers.insert("User-Agent".to_string(), USER_AGENT_VALUE.to_string());

    if let Some(user) = options.impersonate.as_deref().filter(|u| !u.is_empty()) {
        headers.insert("X-Psoxy-User-To-Impersonate".to_string(), user.to_string());
    }
    if options.health_check {
        headers.insert("X-Psoxy-Health-Check".to_string(), "true".to_string());
    }
    if options.request_no_response {
        headers.insert("X-Psoxy-No-Response-Body".to_string(), "true".to_string());
    }
    if options.async_processing {
        headers.insert("Prefer".to_string(), "respond-async".to_string());
    }
    if options.body.as_ref().map(has_content).unwrap_or(false) {
        headers.insert("Content-Type".to_string(), "application/json".to_string());
    }
    headers
}

fn has_content(body: &Value) -> bool {
    match body {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Serialized body to send, if any.
pub(crate) fn request_body(options: &CallOptions) -> Option<String> {
    options
        .body
        .as_ref()
        .filter(|b| has_content(b))
        .map(Value::to_string)
}

/// Headers with credentials masked, for debug output.
fn redact(headers: &BTreeMap<String, String>) -> BTreeMap<&str, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let sensitive = matches!(
                k.to_ascii_lowercase().as_str(),
                "authorization" | "x-psoxy-authorization" | "x-amz-security-token"
            );
            let shown = if sensitive {
                format!("{}…", v.chars().take(12).collect::<String>())
            } else {
                v.clone()
            };
            (k.as_str(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> ProxyClient {
        ProxyClient::new(Transport::default(), Catalog::builtin().unwrap())
    }

    #[test]
    fn test_detect_provider_from_host() {
        let detect = |u: &str| Provider::detect(&Url::parse(u).unwrap());
        assert_eq!(detect("https://abc.lambda-url.us-east-1.on.aws/"), Some(Provider::Aws));
        assert_eq!(
            detect("https://x.execute-api.us-east-1.amazonaws.com/live"),
            Some(Provider::Aws)
        );
        assert_eq!(
            detect("https://us-central1-acme.cloudfunctions.net/psoxy-gcal"),
            Some(Provider::Gcp)
        );
        assert_eq!(detect("https://psoxy-gcal-abc123-uc.a.run.app/"), Some(Provider::Gcp));
        assert_eq!(detect("https://example.com/"), None);
    }

    #[test]
    fn test_resolve_requires_force_for_unknown_hosts() {
        let options = CallOptions::new("https://proxy.internal.example/v1/users").unwrap();
        let err = Provider::resolve(&options).unwrap_err();
        assert!(matches!(err, HarnessError::UnknownProvider { .. }));

        let options = options.with_force(Provider::Gcp);
        assert_eq!(Provider::resolve(&options).unwrap(), Provider::Gcp);
    }

    #[test]
    fn test_method_resolution_order() {
        let client = client();
        let base = "https://abc.lambda-url.us-east-1.on.aws";

        let options = CallOptions::new(&format!("{base}/2/team/members/list_v2")).unwrap();
        assert_eq!(client.resolve_method(&options), Method::POST);

        let options = CallOptions::new(&format!("{base}/v2/users")).unwrap();
        assert_eq!(client.resolve_method(&options), Method::GET);

        let options = options.with_body(json!({"a": 1}));
        assert_eq!(client.resolve_method(&options), Method::POST);

        let options = options.with_method(Method::PUT);
        assert_eq!(client.resolve_method(&options), Method::PUT);

        let options = CallOptions::new(&format!("{base}/v2/users"))
            .unwrap()
            .with_body(json!({}));
        assert_eq!(client.resolve_method(&options), Method::GET);
    }

    #[test]
    fn test_common_headers() {
        let mut options = CallOptions::new("https://abc.lambda-url.us-east-1.on.aws/")
            .unwrap()
            .with_impersonate("alice@acme.com")
            .with_body(json!({"k": "v"}));
        options.health_check = true;
        options.async_processing = true;
        options.gzip = false;

        let headers = common_headers(&options);
        assert_eq!(headers["Accept-Encoding"], "*");
        assert_eq!(headers["X-Psoxy-Skip-Sanitizer"], "false");
        assert_eq!(headers["User-Agent"], "psoxy-test (gzip)");
        assert_eq!(headers["X-Psoxy-User-To-Impersonate"], "alice@acme.com");
        assert_eq!(headers["X-Psoxy-Health-Check"], "true");
        assert_eq!(headers["Prefer"], "respond-async");
        assert_eq!(headers["Content-Type"], "application/json");
        assert!(!headers.contains_key("X-Psoxy-No-Response-Body"));

        let plain = common_headers(&CallOptions::new("https://abc.lambda-url.us-east-1.on.aws/").unwrap());
        assert_eq!(plain["Accept-Encoding"], "gzip,deflate");
        assert!(!plain.contains_key("Content-Type"));
    }

    #[tokio::test]
    async fn test_gcs_backend_uses_access_token() {
        let client = client().with_gcp_tokens(GcpTokenSource::fixed("identity", "access"));
        match client.storage_backend(Provider::Gcp, None, None).await.unwrap() {
            StorageBackend::Gcs { access_token, .. } => assert_eq!(access_token, "access"),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_s3_backend_uses_role_region() {
        let credentials = AwsCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        };
        let client = client().with_aws_credentials(AwsCredentialProvider::Static(credentials));
        match client
            .storage_backend(Provider::Aws, None, Some("eu-west-1"))
            .await
            .unwrap()
        {
            StorageBackend::S3 { region, credentials, endpoint } => {
                assert_eq!(region, "eu-west-1");
                assert_eq!(credentials.access_key_id, "AKIA");
                assert_eq!(endpoint, None);
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_redact_masks_credentials() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer abcdefghijklmnopqrstuvwxyz".to_string());
        headers.insert("Host".to_string(), "example.on.aws".to_string());
        let shown = redact(&headers);
        assert_eq!(shown["Authorization"], "Bearer abcde…");
        assert_eq!(shown["Host"], "example.on.aws");
    }
}
