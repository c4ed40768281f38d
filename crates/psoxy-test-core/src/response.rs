//! Proxy responses and what they tell us about the deployment.

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::transport::TransportFailure;

pub const PSOXY_ERROR_HEADER: &str = "x-psoxy-error";
const AWS_ERROR_TYPE_HEADER: &str = "x-amzn-errortype";
const WWW_AUTHENTICATE_HEADER: &str = "www-authenticate";

/// Outcome of one proxy call.
///
/// `status` is absent when the request never got an HTTP response; `error`
/// then says why.
#[derive(Debug, Clone, Default)]
pub struct ProxyResponse {
    pub status: Option<u16>,
    pub status_text: Option<String>,
    /// Case-insensitive by construction.
    pub headers: HeaderMap,
    pub body: String,
    pub error: Option<TransportFailure>,
}

impl ProxyResponse {
    pub(crate) fn failed(error: TransportFailure) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Some(200)
    }

    /// 202 with a `Location` to poll.
    pub fn async_location(&self) -> Option<&str> {
        if self.status == Some(202) {
            self.header("location")
        } else {
            None
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body parsed as JSON; `None` when empty or not JSON.
    pub fn json(&self) -> Option<Value> {
        if self.body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }

    /// Status line for display: `OK - 200`, or the transport failure.
    pub fn status_message(&self) -> String {
        match (&self.error, self.status) {
            (Some(error), None) => error.to_string(),
            (_, Some(status)) => format!(
                "{} - {}",
                self.status_text.as_deref().unwrap_or("Unknown"),
                status
            ),
            (None, None) => "Unknown".to_string(),
        }
    }

    pub fn proxy_error(&self) -> Option<ProxyErrorKind> {
        self.header(PSOXY_ERROR_HEADER).map(ProxyErrorKind::from_header)
    }

    /// Human explanation of a non-200 response.
    pub fn diagnose(&self) -> Diagnosis {
        let base = match (&self.error, &self.status_text) {
            (Some(error), _) => error.to_string(),
            (None, Some(text)) if !text.is_empty() => text.clone(),
            _ => "Unknown".to_string(),
        };

        let message = if let Some(kind) = self.proxy_error() {
            match kind.description() {
                Some(description) => description.to_string(),
                None => format!("{}: {}", base, kind),
            }
        } else if let Some(aws) = self.header(AWS_ERROR_TYPE_HEADER) {
            format!("{}: AWS {}", base, aws)
        } else if let Some(gcp) = self.header(WWW_AUTHENTICATE_HEADER) {
            format!("{}: GCP {}", base, gcp)
        } else {
            base
        };

        Diagnosis {
            status: self.status,
            message,
            check_logs: matches!(self.status, Some(500) | Some(502)),
        }
    }
}

/// Failure reported by the proxy itself through `x-psoxy-error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyErrorKind {
    BlockedByRules,
    ConnectionSetup,
    ApiError,
    NetworkEgressBlocked,
    Other(String),
}

impl ProxyErrorKind {
    pub fn from_header(value: &str) -> Self {
        match value.trim() {
            "BLOCKED_BY_RULES" => Self::BlockedByRules,
            "CONNECTION_SETUP" => Self::ConnectionSetup,
            "API_ERROR" => Self::ApiError,
            "NETWORK_EGRESS_BLOCKED" => Self::NetworkEgressBlocked,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn description(&self) -> Option<&'static str> {
        match self {
            Self::BlockedByRules => Some("Blocked by rules error: make sure URL path is correct"),
            Self::ConnectionSetup => Some(
                "Connection setup error: make sure the data source is properly configured",
            ),
            Self::ApiError => Some("API error: call to data source failed"),
            Self::NetworkEgressBlocked => Some(
                "Network egress blocked: the proxy is not allowed to reach this host, \
                 check its allowed hosts configuration",
            ),
            Self::Other(_) => None,
        }
    }
}

impl std::fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockedByRules => f.write_str("BLOCKED_BY_RULES"),
            Self::ConnectionSetup => f.write_str("CONNECTION_SETUP"),
            Self::ApiError => f.write_str("API_ERROR"),
            Self::NetworkEgressBlocked => f.write_str("NETWORK_EGRESS_BLOCKED"),
            Self::Other(code) => f.write_str(code),
        }
    }
}

/// What to tell the user about a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub status: Option<u16>,
    pub message: String,
    /// 500/502: most likely an internal proxy error.
    pub check_logs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn response(status: u16, headers: &[(&'static str, &'static str)]) -> ProxyResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(value));
        }
        ProxyResponse {
            status: Some(status),
            status_text: Some("Forbidden".into()),
            headers: map,
            body: String::new(),
            error: None,
        }
    }

    #[test]
    fn test_psoxy_error_header_wins() {
        let r = response(403, &[("x-psoxy-error", "BLOCKED_BY_RULES"), ("x-amzn-errortype", "X")]);
        assert_eq!(r.proxy_error(), Some(ProxyErrorKind::BlockedByRules));
        assert_eq!(
            r.diagnose().message,
            "Blocked by rules error: make sure URL path is correct"
        );
    }

    #[test]
    fn test_unknown_psoxy_error_kept_verbatim() {
        let r = response(500, &[("x-psoxy-error", "SOMETHING_NEW")]);
        let diagnosis = r.diagnose();
        assert_eq!(diagnosis.message, "Forbidden: SOMETHING_NEW");
        assert!(diagnosis.check_logs);
    }

    #[test]
    fn test_cloud_fallback_headers() {
        let aws = response(403, &[("x-amzn-errortype", "AccessDeniedException")]);
        assert_eq!(aws.diagnose().message, "Forbidden: AWS AccessDeniedException");

        let gcp = response(401, &[("www-authenticate", "Bearer error=\"invalid_token\"")]);
        assert_eq!(
            gcp.diagnose().message,
            "Forbidden: GCP Bearer error=\"invalid_token\""
        );
        assert!(!gcp.diagnose().check_logs);
    }

    #[test]
    fn test_transport_failure_message() {
        let r = ProxyResponse::failed(TransportFailure::TakingTooLong);
        assert_eq!(r.status_message(), "Psoxy is taking too long to respond");
        assert_eq!(r.diagnose().message, "Psoxy is taking too long to respond");
        assert!(!r.is_ok());
    }

    #[test]
    fn test_async_location_only_on_202() {
        let mut r = response(202, &[("location", "s3://bucket/key.json")]);
        assert_eq!(r.async_location(), Some("s3://bucket/key.json"));
        r.status = Some(200);
        assert_eq!(r.async_location(), None);
    }
}
