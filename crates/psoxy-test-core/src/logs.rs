//! Log events from a proxy deployment, normalized for display.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

const AWS_LEVELS: [&str; 2] = ["SEVERE", "WARNING"];
const GCP_LEVELS: [&str; 5] = ["WARNING", "ERROR", "CRITICAL", "ALERT", "EMERGENCY"];

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub message: String,
    pub highlight: bool,
}

/// Result of a log lookup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogReport {
    /// Stream (AWS) or resource filter (GCP) the events came from.
    pub source: Option<String>,
    pub events: Vec<LogEvent>,
    /// Console page where the full logs live.
    pub console_url: Option<String>,
}

/// CloudWatch event: `LEVEL:` prefixes become the level, messages starting
/// with "error" are highlighted without one.
pub fn classify_aws_event(timestamp_ms: i64, message: &str) -> LogEvent {
    let timestamp = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default();

    if let Some(level) = AWS_LEVELS.iter().find(|l| message.starts_with(*l)) {
        let rest = &message[level.len()..];
        let rest = rest.strip_prefix(':').unwrap_or(rest);
        return LogEvent {
            timestamp,
            level: Some(level.to_string()),
            message: rest.trim().to_string(),
            highlight: true,
        };
    }

    LogEvent {
        timestamp,
        level: None,
        message: message.to_string(),
        highlight: message.to_ascii_lowercase().starts_with("error"),
    }
}

fn leading_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}.\d{3}").expect("valid date regex")
    })
}

/// Cloud Logging entry: only notable severities are kept as level, and the
/// runtime's own timestamp prefix is dropped from text payloads.
pub fn classify_gcp_entry(
    timestamp: DateTime<Utc>,
    severity: Option<&str>,
    payload: &Value,
) -> LogEvent {
    let text = match payload {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("message").and_then(Value::as_str),
        _ => None,
    };
    let message = match text {
        Some(text) => leading_date().replace(text, "").trim().to_string(),
        None => payload.to_string(),
    };

    let level = severity
        .filter(|s| GCP_LEVELS.contains(s))
        .map(str::to_string);

    LogEvent {
        timestamp,
        highlight: level.is_some(),
        level,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severe_prefix_becomes_level() {
        let event = classify_aws_event(1_700_000_000_000, "SEVERE: disk full");
        assert_eq!(event.level.as_deref(), Some("SEVERE"));
        assert_eq!(event.message, "disk full");
        assert!(event.highlight);
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_error_message_highlighted_without_level() {
        let event = classify_aws_event(0, "Error: connection reset");
        assert_eq!(event.level, None);
        assert!(event.highlight);

        let event = classify_aws_event(0, "START RequestId: abc");
        assert!(!event.highlight);
        assert_eq!(event.message, "START RequestId: abc");
    }

    #[test]
    fn test_gcp_entry_strips_runtime_timestamp() {
        let now = Utc::now();
        let event = classify_gcp_entry(
            now,
            Some("ERROR"),
            &json!("2024-03-01 10:00:00.123 Something broke"),
        );
        assert_eq!(event.message, "Something broke");
        assert_eq!(event.level.as_deref(), Some("ERROR"));
        assert!(event.highlight);

        let event = classify_gcp_entry(now, Some("INFO"), &json!({"message": "ok"}));
        assert_eq!(event.level, None);
        assert_eq!(event.message, "ok");

        let event = classify_gcp_entry(now, None, &json!({"code": 3}));
        assert_eq!(event.message, r#"{"code":3}"#);
    }
}
