//! HTTP transport for proxy calls.
//!
//! This is the ONLY place that turns a `reqwest` outcome into a
//! [`ProxyResponse`]. Failures are folded into the response instead of being
//! returned as errors, so callers always get something to print.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, USER_AGENT};
use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

use crate::error::{HarnessError, HarnessResult};
use crate::response::ProxyResponse;
use crate::types::DEFAULT_REQUEST_TIMEOUT;

pub const USER_AGENT_VALUE: &str = "psoxy-test (gzip)";

/// Why a call produced no usable HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("Psoxy is taking too long to respond")]
    TakingTooLong,

    #[error("{code}: {message}")]
    Network { code: String, message: String },

    #[error("unable to decompress {encoding} response: {message}")]
    Decompress { encoding: String, message: String },
}

/// Owns the HTTP client used for proxy calls.
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
    timeout: Duration,
}

impl Transport {
    pub fn new(timeout: Duration) -> HarnessResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| HarnessError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, timeout })
    }

    /// Shared client, also used for cloud API calls.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request; never fails.
    pub async fn request(
        &self,
        url: &Url,
        method: &Method,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
    ) -> ProxyResponse {
        debug!(url = %url, method = %method, "sending request");

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return ProxyResponse::failed(classify_error(&e)),
        };

        let status = response.status();
        let response_headers = response.headers().clone();
        let raw = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let mut failed = ProxyResponse::failed(classify_error(&e));
                failed.status = Some(status.as_u16());
                failed.headers = response_headers;
                return failed;
            }
        };

        let encoding = response_headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        let (body, error) = match decode_body(encoding.as_deref(), &raw) {
            Ok(decoded) => (decoded, None),
            Err(failure) => {
                warn!(error = %failure, "returning raw body");
                (String::from_utf8_lossy(&raw).into_owned(), Some(failure))
            }
        };

        debug!(status = status.as_u16(), bytes = raw.len(), "response received");

        ProxyResponse {
            status: Some(status.as_u16()),
            status_text: status.canonical_reason().map(str::to_string),
            headers: response_headers,
            body,
            error,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn classify_error(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        return TransportFailure::TakingTooLong;
    }

    let code = if err.is_connect() {
        "CONNECTION_FAILED"
    } else if err.is_redirect() {
        "TOO_MANY_REDIRECTS"
    } else if err.is_body() || err.is_decode() {
        "INVALID_BODY"
    } else if err.is_request() {
        "REQUEST_FAILED"
    } else {
        "NETWORK_ERROR"
    };

    TransportFailure::Network {
        code: code.to_string(),
        message: err.to_string(),
    }
}

/// Decode a body according to `Content-Encoding`.
pub fn decode_body(encoding: Option<&str>, raw: &[u8]) -> Result<String, TransportFailure> {
    let decompressed = match encoding {
        Some("gzip") | Some("x-gzip") => gunzip(raw),
        Some("deflate") => inflate(raw),
        _ => return Ok(String::from_utf8_lossy(raw).into_owned()),
    };

    decompressed
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| TransportFailure::Decompress {
            encoding: encoding.unwrap_or_default().to_string(),
            message: e.to_string(),
        })
}

pub(crate) fn gunzip(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(raw).read_to_end(&mut out)?;
    Ok(out)
}

/// zlib-wrapped deflate first, raw deflate as fallback.
pub(crate) fn inflate(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match ZlibDecoder::new(raw).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(_) => {
            out.clear();
            DeflateDecoder::new(raw).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// gzip magic number check.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_gzip_and_deflate() {
        let text = r#"{"items":[1,2,3]}"#;
        assert_eq!(decode_body(Some("gzip"), &gzip(text.as_bytes())).unwrap(), text);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        let deflated = encoder.finish().unwrap();
        assert_eq!(decode_body(Some("deflate"), &deflated).unwrap(), text);

        assert_eq!(decode_body(None, text.as_bytes()).unwrap(), text);
    }

    #[test]
    fn test_corrupt_gzip_is_decompress_failure() {
        let err = decode_body(Some("gzip"), b"\x1f\x8bnot really").unwrap_err();
        assert!(matches!(err, TransportFailure::Decompress { .. }));
    }

    #[test]
    fn test_gzip_magic() {
        assert!(is_gzip(&gzip(b"a,b\n1,2\n")));
        assert!(!is_gzip(b"a,b\n"));
        assert!(!is_gzip(b""));
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            TransportFailure::TakingTooLong.to_string(),
            "Psoxy is taking too long to respond"
        );
    }
}
