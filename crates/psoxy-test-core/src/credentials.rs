//! Short-lived cloud credentials.
//!
//! Nothing here is cached: every call may mint fresh credentials, and the
//! caller owns whatever it gets back.
//!
//! # AWS
//!
//! - explicit role: STS `AssumeRole` (session `lambda_test`, 900s), signed
//!   with the default chain
//! - otherwise the default chain: environment and shared profiles (resolved
//!   by `reqsign`), web identity, container credentials, EC2 instance
//!   metadata (IMDSv2)
//!
//! # GCP
//!
//! Identity tokens (presented to the proxy) and access tokens (Google Cloud
//! REST APIs) are different things and come from separate sources; a token
//! passed on the command line only ever stands in for the identity token.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use reqsign::{AwsConfig, AwsCredential, AwsDefaultLoader};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::error::{HarnessError, HarnessResult};
use crate::sigv4::{sign_request, SigningParams};
use crate::xml;

pub const ROLE_SESSION_NAME: &str = "lambda_test";
pub const ROLE_SESSION_DURATION_SECS: u32 = 900;

const STS_API_VERSION: &str = "2011-06-15";
const ECS_CREDENTIALS_BASE: &str = "http://169.254.170.2";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

const AWS_CLI_HINT: &str = "Make sure your AWS CLI is configured correctly: \
    https://docs.aws.amazon.com/cli/latest/userguide/cli-chap-authentication.html";
const ROLE_HINT: &str = "Make sure the caller identity (`aws sts get-caller-identity`) \
    is allowed to assume the role: its ARN must be in the role's trust policy / allow-list";
const GCLOUD_HINT: &str = "Make sure gcloud is installed and authenticated: `gcloud auth login`";

/// AWS access key pair plus optional session token.
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where AWS credentials come from.
#[derive(Debug, Clone)]
pub enum AwsCredentialProvider {
    /// Fixed credentials (tests, or already resolved upstream).
    Static(AwsCredentials),

    /// Environment, shared profiles, web identity, container, instance
    /// metadata; first hit wins.
    DefaultChain,

    /// Temporary credentials for `role`, via STS.
    AssumeRole {
        role: String,
        region: String,
        sts_endpoint: String,
    },
}

impl AwsCredentialProvider {
    /// Assume `role` when given, otherwise use the default chain.
    pub fn for_role(role: Option<&str>, region: &str) -> Self {
        match role.filter(|r| !r.is_empty()) {
            Some(role) => Self::AssumeRole {
                role: role.to_string(),
                region: region.to_string(),
                sts_endpoint: format!("https://sts.{}.amazonaws.com/", region),
            },
            None => Self::DefaultChain,
        }
    }

    pub async fn credentials(&self, http: &reqwest::Client) -> HarnessResult<AwsCredentials> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::DefaultChain => {
                let credentials = default_chain(http).await?;
                info!(access_key_id = %credentials.access_key_id, "credentials found");
                Ok(credentials)
            }
            Self::AssumeRole {
                role,
                region,
                sts_endpoint,
            } => {
                debug!(role = %role, "assuming role");
                let base = default_chain(http).await?;
                let credentials = assume_role(http, sts_endpoint, role, region, &base).await?;
                info!(
                    role = %role,
                    access_key_id = %credentials.access_key_id,
                    "using temporary credentials"
                );
                Ok(credentials)
            }
        }
    }
}

/// STS `AssumeRole` signed with `base`.
pub async fn assume_role(
    http: &reqwest::Client,
    sts_endpoint: &str,
    role: &str,
    region: &str,
    base: &AwsCredentials,
) -> HarnessResult<AwsCredentials> {
    let mut url = Url::parse(sts_endpoint)
        .map_err(|e| HarnessError::config(format!("invalid STS endpoint {}: {}", sts_endpoint, e)))?;
    url.query_pairs_mut()
        .append_pair("Action", "AssumeRole")
        .append_pair("Version", STS_API_VERSION)
        .append_pair("RoleArn", role)
        .append_pair("RoleSessionName", ROLE_SESSION_NAME)
        .append_pair("DurationSeconds", &ROLE_SESSION_DURATION_SECS.to_string());

    let signed = sign_request(
        &SigningParams {
            url: &url,
            method: &Method::GET,
            body: None,
            headers: &[],
            region,
            service: "sts",
            now: Utc::now(),
        },
        base,
    );

    let mut request = http.get(url.clone());
    for (name, value) in &signed.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| HarnessError::Auth {
        message: format!("STS request failed: {}", e),
        hint: AWS_CLI_HINT.to_string(),
    })?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(sts_error(&format!("unable to assume role {}", role), status, &body));
    }
    sts_credentials(&body, "AssumeRole")
}

fn sts_error(what: &str, status: reqwest::StatusCode, body: &str) -> HarnessError {
    let code = xml::first_text(body, "Code").unwrap_or_else(|| status.to_string());
    let message = xml::first_text(body, "Message").unwrap_or_default();
    HarnessError::Auth {
        message: format!("{}: {} {}", what, code, message).trim_end().to_string(),
        hint: ROLE_HINT.to_string(),
    }
}

fn sts_credentials(body: &str, action: &str) -> HarnessResult<AwsCredentials> {
    let field = |tag: &str| {
        xml::first_text(body, tag).ok_or_else(|| HarnessError::InvalidResponse {
            message: format!("{} response without {}", action, tag),
        })
    };

    Ok(AwsCredentials {
        access_key_id: field("AccessKeyId")?,
        secret_access_key: field("SecretAccessKey")?,
        session_token: Some(field("SessionToken")?),
    })
}

async fn default_chain(http: &reqwest::Client) -> HarnessResult<AwsCredentials> {
    let config = shared_config();

    if let Some(credentials) = from_config(&config) {
        debug!(profile = %config.profile, "using AWS credentials from environment or shared profile");
        return Ok(credentials);
    }

    if let Some(credentials) = from_web_identity(http, &config).await? {
        debug!("using AWS credentials from web identity token");
        return Ok(credentials);
    }

    if let Some(credentials) = from_container(http).await? {
        debug!("using AWS credentials from container endpoint");
        return Ok(credentials);
    }

    if config.ec2_metadata_disabled {
        return Err(no_credentials("instance metadata disabled"));
    }
    let imds = AwsDefaultLoader::new(http.clone(), AwsConfig::default());
    match imds.load().await {
        Ok(Some(credential)) => {
            debug!("using AWS credentials from instance metadata");
            Ok(credential.into())
        }
        Ok(None) => Err(no_credentials("instance metadata returned nothing")),
        Err(e) => Err(no_credentials(&format!("{:#}", e))),
    }
}

fn no_credentials(detail: &str) -> HarnessError {
    HarnessError::Auth {
        message: format!(
            "no AWS credentials found (env, shared profiles, web identity, container, instance metadata): {}",
            detail
        ),
        hint: AWS_CLI_HINT.to_string(),
    }
}

/// Environment overlaid on `~/.aws/config` and `~/.aws/credentials`
/// (`AWS_PROFILE`, `AWS_CONFIG_FILE`, `AWS_SHARED_CREDENTIALS_FILE`).
fn shared_config() -> AwsConfig {
    AwsConfig {
        role_session_name: ROLE_SESSION_NAME.to_string(),
        ..AwsConfig::default()
    }
    .from_profile()
    .from_env()
}

fn from_config(config: &AwsConfig) -> Option<AwsCredentials> {
    let non_empty = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());
    Some(AwsCredentials {
        access_key_id: non_empty(&config.access_key_id)?,
        secret_access_key: non_empty(&config.secret_access_key)?,
        session_token: non_empty(&config.session_token),
    })
}

/// STS endpoint for unsigned calls: `AWS_ENDPOINT_URL_STS`, else regional
/// when a region is configured, else global.
fn sts_endpoint(config: &AwsConfig) -> String {
    if let Ok(endpoint) = std::env::var("AWS_ENDPOINT_URL_STS") {
        if !endpoint.is_empty() {
            return endpoint;
        }
    }
    match config.region.as_deref().filter(|r| !r.is_empty()) {
        Some(region) => format!("https://sts.{}.amazonaws.com/", region),
        None => "https://sts.amazonaws.com/".to_string(),
    }
}

/// `AssumeRoleWithWebIdentity` with the token in `AWS_WEB_IDENTITY_TOKEN_FILE`
/// for `AWS_ROLE_ARN` (or the profile's `web_identity_token_file`/`role_arn`).
async fn from_web_identity(
    http: &reqwest::Client,
    config: &AwsConfig,
) -> HarnessResult<Option<AwsCredentials>> {
    let (Some(token_file), Some(role)) = (
        config.web_identity_token_file.as_deref().filter(|v| !v.is_empty()),
        config.role_arn.as_deref().filter(|v| !v.is_empty()),
    ) else {
        return Ok(None);
    };

    let token = tokio::fs::read_to_string(token_file)
        .await
        .map_err(|e| HarnessError::io(token_file, e))?;

    let endpoint = sts_endpoint(config);
    let mut url = Url::parse(&endpoint)
        .map_err(|e| HarnessError::config(format!("invalid STS endpoint {}: {}", endpoint, e)))?;
    url.query_pairs_mut()
        .append_pair("Action", "AssumeRoleWithWebIdentity")
        .append_pair("Version", STS_API_VERSION)
        .append_pair("RoleArn", role)
        .append_pair("RoleSessionName", &config.role_session_name)
        .append_pair("WebIdentityToken", token.trim());
    if let Some(duration) = config.duration_seconds {
        url.query_pairs_mut()
            .append_pair("DurationSeconds", &duration.to_string());
    }

    let response = http.get(url).send().await.map_err(|e| HarnessError::Auth {
        message: format!("STS request failed: {}", e),
        hint: AWS_CLI_HINT.to_string(),
    })?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(sts_error(&format!("web identity for {}", role), status, &body));
    }
    sts_credentials(&body, "AssumeRoleWithWebIdentity").map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

/// ECS task role / container credential endpoint.
async fn from_container(http: &reqwest::Client) -> HarnessResult<Option<AwsCredentials>> {
    let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    let url = match (
        env("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI"),
        env("AWS_CONTAINER_CREDENTIALS_FULL_URI"),
    ) {
        (Some(relative), _) => format!("{}{}", ECS_CREDENTIALS_BASE, relative),
        (None, Some(full)) => full,
        (None, None) => return Ok(None),
    };

    let authorization = match (
        env("AWS_CONTAINER_AUTHORIZATION_TOKEN"),
        env("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE"),
    ) {
        (Some(token), _) => Some(token),
        (None, Some(path)) => Some(
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| HarnessError::io(&path, e))?
                .trim()
                .to_string(),
        ),
        (None, None) => None,
    };

    let mut request = http.get(&url).timeout(METADATA_TIMEOUT);
    if let Some(authorization) = authorization {
        request = request.header(reqwest::header::AUTHORIZATION, authorization);
    }
    let credentials: ContainerCredentials = request
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| no_credentials(&format!("container endpoint {}: {}", url, e)))?
        .json()
        .await?;

    Ok(Some(AwsCredentials {
        access_key_id: credentials.access_key_id,
        secret_access_key: credentials.secret_access_key,
        session_token: credentials.token,
    }))
}

impl From<AwsCredential> for AwsCredentials {
    fn from(credential: AwsCredential) -> Self {
        Self {
            access_key_id: credential.access_key_id,
            secret_access_key: credential.secret_access_key,
            session_token: credential.session_token,
        }
    }
}

/// Ambient GCP account.
#[derive(Debug, Clone)]
pub enum GcpTokenSource {
    /// Fixed tokens (tests, emulators).
    Static { identity: String, access: String },

    /// `gcloud` CLI.
    Gcloud { binary: String },
}

impl GcpTokenSource {
    pub fn gcloud() -> Self {
        Self::Gcloud {
            binary: "gcloud".to_string(),
        }
    }

    pub fn fixed(identity: impl Into<String>, access: impl Into<String>) -> Self {
        Self::Static {
            identity: identity.into(),
            access: access.into(),
        }
    }

    /// Identity token to present to the proxy; a non-empty `explicit` token
    /// (`--token`) is used as is.
    pub async fn identity_token(&self, explicit: Option<&str>) -> HarnessResult<String> {
        if let Some(token) = explicit.filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }
        match self {
            Self::Static { identity, .. } => Ok(identity.clone()),
            Self::Gcloud { binary } => {
                debug!("getting Google Cloud identity token");
                run_gcloud(binary, &["auth", "print-identity-token"]).await
            }
        }
    }

    /// OAuth access token for Google Cloud REST APIs.
    pub async fn access_token(&self) -> HarnessResult<String> {
        match self {
            Self::Static { access, .. } => Ok(access.clone()),
            Self::Gcloud { binary } => run_gcloud(binary, &["auth", "print-access-token"]).await,
        }
    }
}

async fn run_gcloud(binary: &str, args: &[&str]) -> HarnessResult<String> {
    let output = tokio::process::Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| HarnessError::Auth {
            message: format!("unable to run `{} {}`: {}", binary, args.join(" "), e),
            hint: GCLOUD_HINT.to_string(),
        })?;

    if !output.status.success() {
        return Err(HarnessError::Auth {
            message: format!(
                "`{} {}` failed: {}",
                binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            hint: GCLOUD_HINT.to_string(),
        });
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(HarnessError::Auth {
            message: format!("`{} {}` returned no token", binary, args.join(" ")),
            hint: GCLOUD_HINT.to_string(),
        });
    }
    Ok(token)
}
