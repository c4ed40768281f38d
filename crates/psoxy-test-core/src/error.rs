//! Error types for the test harness core.

use std::time::Duration;

/// Harness errors.
///
/// Proxy-reported failures (`x-psoxy-error`) are not errors at this level:
/// they travel inside [`crate::ProxyResponse`] so graph walks can continue.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Missing or malformed option.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// URL could not be parsed.
    #[error("\"{input}\" is not a valid URL")]
    InvalidUrl { input: String },

    /// URL matched neither AWS nor GCP deploy patterns.
    #[error("\"{url}\" doesn't seem to be a valid endpoint: AWS or GCP\nUse \"-f\" option if you're certain it's a valid deploy")]
    UnknownProvider { url: String },

    /// No catalog registered under that name.
    #[error("unknown data source: {name}")]
    UnknownDataSource { name: String },

    /// Catalog failed load-time validation.
    #[error("invalid catalog {data_source}: {reason}")]
    InvalidCatalog { data_source: String, reason: String },

    /// Credential lookup or role assumption failed.
    #[error("unable to get credentials: {message}\n{hint}")]
    Auth { message: String, hint: String },

    /// KMS signing failed.
    #[error("signing with {key} failed: {message}")]
    Kms { key: String, message: String },

    /// Network-level failure outside the proxy call path.
    #[error("network error: {message}")]
    Network { message: String },

    /// Object does not exist (yet).
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// Any other storage failure.
    #[error("storage error ({bucket}): {message}")]
    Storage { bucket: String, message: String },

    /// Unexpected response from a cloud API.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Retry loop gave up without a result.
    #[error("{what} not found after {attempts} attempts")]
    NotFoundAfterRetries { what: String, attempts: u32 },

    /// Timed out while polling.
    #[error("{what}: nothing found within {timeout:?}")]
    PollTimeout { what: String, timeout: Duration },

    /// Content verification failed.
    #[error("verification failed: {reason}")]
    Verification {
        reason: String,
        expected: Option<String>,
        found: Option<String>,
    },

    /// Local file access.
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Bad input
            Self::Config { .. } => 1,
            Self::InvalidUrl { .. } => 1,
            Self::UnknownProvider { .. } => 1,
            Self::UnknownDataSource { .. } => 1,
            Self::InvalidCatalog { .. } => 1,

            // Auth issues
            Self::Auth { .. } => 2,
            Self::Kms { .. } => 2,

            // Network/transient
            Self::Network { .. } => 3,
            Self::ObjectNotFound { .. } => 3,
            Self::Storage { .. } => 3,
            Self::InvalidResponse { .. } => 3,

            // Test failures
            Self::NotFoundAfterRetries { .. } => 4,
            Self::PollTimeout { .. } => 4,
            Self::Verification { .. } => 4,

            Self::Io { .. } => 5,
        }
    }

    /// Whether the error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. } | Self::Network { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub(crate) fn verification(reason: impl Into<String>) -> Self {
        Self::Verification {
            reason: reason.into(),
            expected: None,
            found: None,
        }
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_group_by_category() {
        assert_eq!(HarnessError::config("missing url").exit_code(), 1);
        assert_eq!(
            HarnessError::Auth {
                message: "denied".into(),
                hint: "check role".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(HarnessError::verification("mismatch").exit_code(), 4);
    }

    #[test]
    fn test_only_not_found_and_network_are_retryable() {
        let not_found = HarnessError::ObjectNotFound {
            bucket: "out".into(),
            key: "a.csv".into(),
        };
        assert!(not_found.is_retryable());

        let denied = HarnessError::Storage {
            bucket: "out".into(),
            message: "AccessDenied".into(),
        };
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_unknown_provider_message_carries_tip() {
        let err = HarnessError::UnknownProvider {
            url: "https://example.com".into(),
        };
        let text = err.to_string();
        assert!(text.contains("https://example.com"));
        assert!(text.contains("-f"));
    }
}
