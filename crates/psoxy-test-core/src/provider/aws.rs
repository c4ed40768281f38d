//! AWS deployments: Lambda function URLs and API Gateway.

use std::collections::BTreeMap;

use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::{common_headers, request_body, ProxyClient};
use crate::credentials::AwsCredentials;
use crate::error::{HarnessError, HarnessResult};
use crate::logs::{classify_aws_event, LogReport};
use crate::sigv4::{sign, sign_request, SigningParams};
use crate::types::CallOptions;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Header carrying the identity JWT next to the SigV4 `Authorization`.
pub const IDENTITY_HEADER: &str = "X-Psoxy-Authorization";

const LOG_STREAM_LIMIT: u32 = 10;

/// Method, signed headers and body for an AWS proxy call.
pub(crate) async fn prepare(
    client: &ProxyClient,
    options: &CallOptions,
) -> HarnessResult<(Method, BTreeMap<String, String>, Option<String>)> {
    let method = client.resolve_method(options);
    let region = ProxyClient::aws_region(options);
    let credentials = client
        .aws_credentials(options.role.as_deref(), &region)
        .await?;

    debug!(region = %region, "signing request");
    let body = request_body(options);
    let now = Utc::now();
    let signed = sign(
        &options.url,
        &method,
        body.as_deref(),
        &credentials,
        &region,
        now,
    );

    let mut headers = common_headers(options);
    headers.extend(signed.headers);

    if let Some(key) = &options.signing_key {
        let jwt = client
            .identity_jwt(key, options, &region, Some(&credentials), now)
            .await?;
        headers.insert(IDENTITY_HEADER.to_string(), format!("Bearer {}", jwt));
    }

    Ok((method, headers, body))
}

/// POST an `application/x-amz-json-1.1` request to an AWS JSON API.
///
/// Err carries a readable reason (`Type (status): message`).
pub(crate) async fn json_api_call(
    http: &reqwest::Client,
    endpoint: &str,
    target: &str,
    body: &str,
    region: &str,
    service: &str,
    credentials: &AwsCredentials,
) -> Result<String, String> {
    let url = Url::parse(endpoint).map_err(|e| format!("invalid endpoint {}: {}", endpoint, e))?;
    let extra = [
        ("content-type", "application/x-amz-json-1.1".to_string()),
        ("x-amz-target", target.to_string()),
    ];
    let signed = sign_request(
        &SigningParams {
            url: &url,
            method: &Method::POST,
            body: Some(body.as_bytes()),
            headers: &extra,
            region,
            service,
            now: Utc::now(),
        },
        credentials,
    );

    let mut request = http.post(url).body(body.to_string());
    for (name, value) in &signed.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    let text = response.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(json_api_error(status.as_u16(), &text));
    }
    Ok(text)
}

pub(crate) fn json_api_error(status: u16, body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let kind = parsed
        .as_ref()
        .and_then(|v| v.get("__type"))
        .and_then(|v| v.as_str())
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("Message")))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match (kind, message) {
        (Some(kind), Some(message)) => format!("{} ({}): {}", kind, status, message),
        (Some(kind), None) => format!("{} ({})", kind, status),
        _ => format!("HTTP {}: {}", status, body),
    }
}

/// Which CloudWatch log group to read.
#[derive(Debug, Clone)]
pub struct AwsLogsOptions {
    pub log_group: String,
    pub role: Option<String>,
    pub region: String,
}

impl AwsLogsOptions {
    pub fn new(log_group: impl Into<String>) -> Self {
        Self {
            log_group: log_group.into(),
            role: None,
            region: DEFAULT_REGION.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStream {
    log_stream_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsOutput {
    #[serde(default)]
    log_streams: Vec<LogStream>,
}

#[derive(Debug, Deserialize)]
struct OutputLogEvent {
    timestamp: i64,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct GetLogEventsOutput {
    #[serde(default)]
    events: Vec<OutputLogEvent>,
}

/// Latest events of the most recently written stream in the log group.
pub async fn fetch_logs(client: &ProxyClient, options: &AwsLogsOptions) -> HarnessResult<LogReport> {
    if options.role.is_some() {
        debug!(role = ?options.role, "assuming role for logs");
    }
    let credentials = client
        .aws_credentials(options.role.as_deref(), &options.region)
        .await?;
    let endpoint = client
        .endpoints()
        .cloudwatch_logs
        .clone()
        .unwrap_or_else(|| format!("https://logs.{}.amazonaws.com/", options.region));

    let logs_error = |message: String| HarnessError::InvalidResponse {
        message: format!("unable to get logs for {}: {}", options.log_group, message),
    };

    debug!(log_group = %options.log_group, "describing log streams");
    let streams_body = json!({
        "logGroupName": options.log_group,
        "orderBy": "LastEventTime",
        "descending": true,
        "limit": LOG_STREAM_LIMIT,
    })
    .to_string();
    let streams = json_api_call(
        client.http(),
        &endpoint,
        "Logs_20140328.DescribeLogStreams",
        &streams_body,
        &options.region,
        "logs",
        &credentials,
    )
    .await
    .map_err(logs_error)?;
    let streams: DescribeLogStreamsOutput =
        serde_json::from_str(&streams).map_err(|e| logs_error(e.to_string()))?;

    let console_url = Some(console_url(&options.region));
    let Some(stream) = streams.log_streams.into_iter().next() else {
        info!(
            log_group = %options.log_group,
            "log group seems to be set correctly, but no logs were found"
        );
        return Ok(LogReport {
            source: None,
            events: Vec::new(),
            console_url,
        });
    };

    info!(stream = %stream.log_stream_name, "getting log events");
    let events_body = json!({
        "logGroupName": options.log_group,
        "logStreamName": stream.log_stream_name,
    })
    .to_string();
    let events = json_api_call(
        client.http(),
        &endpoint,
        "Logs_20140328.GetLogEvents",
        &events_body,
        &options.region,
        "logs",
        &credentials,
    )
    .await
    .map_err(logs_error)?;
    let events: GetLogEventsOutput =
        serde_json::from_str(&events).map_err(|e| logs_error(e.to_string()))?;

    Ok(LogReport {
        source: Some(stream.log_stream_name),
        events: events
            .events
            .iter()
            .map(|e| classify_aws_event(e.timestamp, &e.message))
            .collect(),
        console_url,
    })
}

/// CloudWatch console home; neither function nor group is known from a URL.
pub fn console_url(region: &str) -> String {
    format!("https://{}.console.aws.amazon.com/cloudwatch/home", region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_api_error_message() {
        let body = r#"{"__type":"com.amazonaws.kms#AccessDeniedException","message":"no"}"#;
        assert_eq!(json_api_error(400, body), "AccessDeniedException (400): no");
        let body = r#"{"__type":"ResourceNotFoundException"}"#;
        assert_eq!(json_api_error(400, body), "ResourceNotFoundException (400)");
        assert_eq!(json_api_error(500, "oops"), "HTTP 500: oops");
    }

    #[test]
    fn test_console_url() {
        assert_eq!(
            console_url("eu-west-1"),
            "https://eu-west-1.console.aws.amazon.com/cloudwatch/home"
        );
    }
}
