//! RS256 identity JWTs signed by a cloud KMS key.
//!
//! The private key never leaves the KMS: we hash the signing input locally and
//! ask the KMS to sign the SHA-256 digest.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::credentials::{AwsCredentials, GcpTokenSource};
use crate::error::{HarnessError, HarnessResult};
use crate::provider::aws::json_api_call;

/// Lifetime of a minted token.
pub const TOKEN_TTL_SECS: i64 = 3600;

const AWS_SIGNING_ALGORITHM: &str = "RSASSA_PKCS1_V1_5_SHA_256";
const GCP_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JwtHeader {
    pub alg: String,
    pub kid: String,
    pub typ: String,
}

impl JwtHeader {
    pub fn rs256(kid: &str) -> Self {
        Self {
            alg: "RS256".into(),
            kid: kid.into(),
            typ: "JWT".into(),
        }
    }
}

/// Registered claims; `aud` mirrors `iss`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JwtClaims {
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl JwtClaims {
    pub fn new(issuer: &str, subject: Option<&str>, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            iss: issuer.to_string(),
            sub: subject.map(str::to_string),
            aud: issuer.to_string(),
            iat,
            exp: iat + TOKEN_TTL_SECS,
        }
    }
}

/// Something that can sign a SHA-256 digest with an RSA key.
#[async_trait]
pub trait KmsSigner: Send + Sync {
    /// Reference placed in the JWT `kid`.
    fn key_id(&self) -> &str;

    /// Raw PKCS#1 v1.5 signature over `digest`.
    async fn sign_digest(&self, digest: &[u8]) -> HarnessResult<Vec<u8>>;
}

/// `b64url(header).b64url(claims)`
pub fn signing_input(header: &JwtHeader, claims: &JwtClaims) -> HarnessResult<String> {
    let header = serde_json::to_vec(header)
        .map_err(|e| HarnessError::config(format!("unable to encode JWT header: {}", e)))?;
    let claims = serde_json::to_vec(claims)
        .map_err(|e| HarnessError::config(format!("unable to encode JWT claims: {}", e)))?;
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims)
    ))
}

/// Build and sign a compact JWT.
pub async fn sign_jwt(signer: &dyn KmsSigner, claims: &JwtClaims) -> HarnessResult<String> {
    let input = signing_input(&JwtHeader::rs256(signer.key_id()), claims)?;
    let digest = Sha256::digest(input.as_bytes());
    let signature = signer.sign_digest(&digest).await?;
    debug!(kid = %signer.key_id(), "identity token signed");
    Ok(format!("{}.{}", input, URL_SAFE_NO_PAD.encode(signature)))
}

/// AWS KMS `Sign` over the JSON API.
#[derive(Debug, Clone)]
pub struct AwsKmsSigner {
    http: reqwest::Client,
    key_arn: String,
    region: String,
    credentials: AwsCredentials,
    endpoint: String,
}

impl AwsKmsSigner {
    /// Region is taken from the key ARN, falling back to `default_region`.
    pub fn new(
        http: reqwest::Client,
        key_arn: &str,
        default_region: &str,
        credentials: AwsCredentials,
    ) -> Self {
        let region = key_arn
            .split(':')
            .nth(3)
            .filter(|r| !r.is_empty())
            .unwrap_or(default_region)
            .to_string();
        let endpoint = format!("https://kms.{}.amazonaws.com/", region);
        Self {
            http,
            key_arn: key_arn.to_string(),
            region,
            credentials,
            endpoint,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[derive(Debug, Deserialize)]
struct AwsSignResponse {
    #[serde(rename = "Signature")]
    signature: String,
}

#[async_trait]
impl KmsSigner for AwsKmsSigner {
    fn key_id(&self) -> &str {
        &self.key_arn
    }

    async fn sign_digest(&self, digest: &[u8]) -> HarnessResult<Vec<u8>> {
        let body = json!({
            "KeyId": self.key_arn,
            "Message": STANDARD.encode(digest),
            "MessageType": "DIGEST",
            "SigningAlgorithm": AWS_SIGNING_ALGORITHM,
        })
        .to_string();

        let response = json_api_call(
            &self.http,
            &self.endpoint,
            "TrentService.Sign",
            &body,
            &self.region,
            "kms",
            &self.credentials,
        )
        .await
        .map_err(|message| self.kms_error(message))?;

        let parsed: AwsSignResponse =
            serde_json::from_str(&response).map_err(|e| self.kms_error(e.to_string()))?;
        STANDARD
            .decode(parsed.signature)
            .map_err(|e| self.kms_error(format!("signature is not base64: {}", e)))
    }
}

impl AwsKmsSigner {
    fn kms_error(&self, message: String) -> HarnessError {
        HarnessError::Kms {
            key: self.key_arn.clone(),
            message,
        }
    }
}

/// GCP Cloud KMS `asymmetricSign` on the newest enabled key version.
#[derive(Debug, Clone)]
pub struct GcpKmsSigner {
    http: reqwest::Client,
    key_path: String,
    tokens: GcpTokenSource,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyVersion {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyVersionList {
    #[serde(default)]
    crypto_key_versions: Vec<KeyVersion>,
}

#[derive(Debug, Deserialize)]
struct AsymmetricSignResponse {
    signature: String,
}

impl GcpKmsSigner {
    pub fn new(http: reqwest::Client, key_path: &str, tokens: GcpTokenSource) -> Self {
        Self {
            http,
            key_path: key_path.trim_matches('/').to_string(),
            tokens,
            endpoint: GCP_KMS_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn kms_error(&self, message: impl Into<String>) -> HarnessError {
        HarnessError::Kms {
            key: self.key_path.clone(),
            message: message.into(),
        }
    }

    async fn latest_enabled_version(&self, token: &str) -> HarnessResult<String> {
        let url = format!("{}/v1/{}/cryptoKeyVersions", self.endpoint, self.key_path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("filter", "state = ENABLED")])
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(self.kms_error(format!("listing key versions: HTTP {}: {}", status, text)));
        }

        let list: KeyVersionList =
            serde_json::from_str(&text).map_err(|e| self.kms_error(e.to_string()))?;
        list.crypto_key_versions
            .into_iter()
            .filter(|v| v.state.is_empty() || v.state == "ENABLED")
            .max_by_key(|v| v.create_time)
            .map(|v| {
                let id = v.name.rsplit('/').next().unwrap_or(&v.name).to_string();
                format!("{}/cryptoKeyVersions/{}", self.key_path, id)
            })
            .ok_or_else(|| self.kms_error("no enabled versions found for key"))
    }
}

#[async_trait]
impl KmsSigner for GcpKmsSigner {
    fn key_id(&self) -> &str {
        &self.key_path
    }

    async fn sign_digest(&self, digest: &[u8]) -> HarnessResult<Vec<u8>> {
        let token = self.tokens.access_token().await?;
        let version = self.latest_enabled_version(&token).await?;
        debug!(version = %version, "signing with key version");

        let url = format!("{}/v1/{}:asymmetricSign", self.endpoint, version);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "digest": { "sha256": STANDARD.encode(digest) } }))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(self.kms_error(format!("asymmetricSign: HTTP {}: {}", status, text)));
        }

        let parsed: AsymmetricSignResponse =
            serde_json::from_str(&text).map_err(|e| self.kms_error(e.to_string()))?;
        STANDARD
            .decode(parsed.signature)
            .map_err(|e| self.kms_error(format!("signature is not base64: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedSigner;

    #[async_trait]
    impl KmsSigner for FixedSigner {
        fn key_id(&self) -> &str {
            "aws-test-key"
        }

        async fn sign_digest(&self, digest: &[u8]) -> HarnessResult<Vec<u8>> {
            assert_eq!(digest.len(), 32);
            Ok(vec![0xfb, 0xff, 0xfe])
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_claims_mirror_issuer_and_expire_in_an_hour() {
        let claims = JwtClaims::new("https://issuer.example", Some("tester"), now());
        assert_eq!(claims.aud, claims.iss);
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(claims.sub.as_deref(), Some("tester"));

        let encoded = serde_json::to_string(&JwtClaims::new("i", None, now())).unwrap();
        assert!(!encoded.contains("sub"));
    }

    #[tokio::test]
    async fn test_jwt_segments_are_unpadded_base64url() {
        let claims = JwtClaims::new("https://issuer.example", None, now());
        let token = sign_jwt(&FixedSigner, &claims).await.unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert!(!part.contains('='));
            assert!(!part.contains('+'));
            assert!(!part.contains('/'));
        }
        assert_eq!(parts[2], "-__-");

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "aws-test-key");
        assert_eq!(header["typ"], "JWT");
    }

    #[test]
    fn test_aws_signer_region_from_arn() {
        let credentials = AwsCredentials {
            access_key_id: "a".into(),
            secret_access_key: "s".into(),
            session_token: None,
        };
        let signer = AwsKmsSigner::new(
            reqwest::Client::new(),
            "arn:aws:kms:eu-central-1:123456789012:key/abcd",
            "us-east-1",
            credentials.clone(),
        );
        assert_eq!(signer.region(), "eu-central-1");

        let signer = AwsKmsSigner::new(reqwest::Client::new(), "alias/x", "us-west-2", credentials);
        assert_eq!(signer.region(), "us-west-2");
    }
}
