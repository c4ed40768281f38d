//! AWS Signature Version 4.
//!
//! Pure functions: the timestamp is an input, so the same request, credentials
//! and clock always produce the same header set.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::credentials::AwsCredentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const DEFAULT_REGION: &str = "us-east-1";

/// Hex SHA-256 of the empty payload.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Headers produced for one request; consumed by the transport right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub headers: BTreeMap<String, String>,
    pub method: Method,
    pub path: String,
    pub host: String,
    pub region: Option<String>,
    pub service: Option<String>,
}

/// Everything the signature covers besides the credentials.
#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub url: &'a Url,
    pub method: &'a Method,
    pub body: Option<&'a [u8]>,
    /// Extra headers to include in the signature (e.g. `x-amz-target`).
    pub headers: &'a [(&'a str, String)],
    pub region: &'a str,
    pub service: &'a str,
    pub now: DateTime<Utc>,
}

/// Sign a proxy call.
///
/// Service comes from the host; a JSON `content-type` is signed for POST
/// requests carrying a non-empty body.
pub fn sign(
    url: &Url,
    method: &Method,
    body: Option<&str>,
    credentials: &AwsCredentials,
    region: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let service = service_from_host(url.host_str().unwrap_or_default());
    let body = body.filter(|b| !b.is_empty()).map(str::as_bytes);

    let mut headers = Vec::new();
    if *method == Method::POST && body.is_some() {
        headers.push(("content-type", "application/json".to_string()));
    }

    sign_request(
        &SigningParams {
            url,
            method,
            body,
            headers: &headers,
            region,
            service: &service,
            now,
        },
        credentials,
    )
}

/// Sign an arbitrary AWS API request.
pub fn sign_request(params: &SigningParams<'_>, credentials: &AwsCredentials) -> SignedRequest {
    let amz_date = params.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = params.now.format("%Y%m%d").to_string();
    let host = host_header(params.url);
    let payload_hash = hex::encode(Sha256::digest(params.body.unwrap_or_default()));

    // Canonical header set, lowercase names, sorted by BTreeMap.
    let mut signed: BTreeMap<String, String> = BTreeMap::new();
    signed.insert("host".into(), host.clone());
    signed.insert("x-amz-date".into(), amz_date.clone());
    if let Some(token) = &credentials.session_token {
        signed.insert("x-amz-security-token".into(), token.clone());
    }
    if params.service == "s3" {
        signed.insert("x-amz-content-sha256".into(), payload_hash.clone());
    }
    for (name, value) in params.headers {
        signed.insert(name.to_ascii_lowercase(), value.trim().to_string());
    }

    let canonical_headers: String = signed
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = signed.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        params.method.as_str(),
        canonical_uri(params.url, params.service),
        canonical_query(params.url),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, params.region, params.service
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(
        &credentials.secret_access_key,
        &date_stamp,
        params.region,
        params.service,
    );
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, credentials.access_key_id, scope, signed_headers, signature
    );

    let mut headers = BTreeMap::new();
    for (name, value) in &signed {
        headers.insert(display_header_name(name), value.clone());
    }
    headers.insert("Authorization".into(), authorization);

    let path = match params.url.query() {
        Some(q) => format!("{}?{}", params.url.path(), q),
        None => params.url.path().to_string(),
    };

    SignedRequest {
        headers,
        method: params.method.clone(),
        path,
        host,
        region: Some(params.region.to_string()),
        service: Some(params.service.to_string()),
    }
}

/// Region from `{id}.{service}.{region}.(amazonaws.com|on.aws)`; `us-east-1`
/// when the host is too short to carry one.
pub fn resolve_region(url: &Url) -> String {
    let parts: Vec<&str> = url.host_str().unwrap_or_default().split('.').collect();
    if parts.len() > 2 {
        parts[2].to_string()
    } else {
        DEFAULT_REGION.to_string()
    }
}

/// Service from the second host label.
///
/// Function URLs (`{id}.lambda-url.{region}.on.aws`) sign as `lambda`;
/// API Gateway hosts already carry `execute-api`.
pub fn service_from_host(host: &str) -> String {
    match host.split('.').nth(1) {
        Some("lambda-url") => "lambda".to_string(),
        Some(part) => part.to_string(),
        None => String::new(),
    }
}

/// HMAC chain: date → region → service → `aws4_request`.
pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn display_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// S3 signs the decoded path encoded once; other services encode the
/// already-encoded path segments a second time.
fn canonical_uri(url: &Url, service: &str) -> String {
    let path = url.path();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    path.split('/')
        .map(|segment| {
            if service == "s3" {
                uri_encode(&percent_decode(segment))
            } else {
                uri_encode(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Everything but RFC 3986 unreserved characters.
const AWS_URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, AWS_URI_ENCODE).to_string()
}

fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}
