//! GCP deployments: Cloud Functions Gen1 and Cloud Run (Gen2).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use super::{common_headers, request_body, ProxyClient, GCP_GEN1_DOMAIN, GCP_GEN2_DOMAIN};
use crate::error::{HarnessError, HarnessResult};
use crate::logs::{classify_gcp_entry, LogReport};
use crate::types::CallOptions;

const CONSOLE_ROOT: &str = "https://console.cloud.google.com";
const LOGGING_ENDPOINT: &str = "https://logging.googleapis.com";
const SCHEDULER_ENDPOINT: &str = "https://cloudscheduler.googleapis.com";
const LOG_PAGE_SIZE: u32 = 50;

/// Method, headers and body for a GCP proxy call.
pub(crate) async fn prepare(
    client: &ProxyClient,
    options: &CallOptions,
) -> HarnessResult<(Method, BTreeMap<String, String>, Option<String>)> {
    let bearer = match &options.signing_key {
        Some(key) => {
            let region = ProxyClient::aws_region(options);
            client
                .identity_jwt(key, options, &region, None, Utc::now())
                .await?
        }
        None => {
            debug!("getting Google Cloud identity token");
            client
                .gcp_tokens()
                .identity_token(options.token.as_deref())
                .await?
        }
    };

    let mut headers = common_headers(options);
    headers.insert("Authorization".to_string(), format!("Bearer {}", bearer));

    Ok((client.resolve_method(options), headers, request_body(options)))
}

/// Cloud Run region from the short code in `*-xx.a.run.app` hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gen2Region {
    UsCentral1,
    UsWest1,
    UsEast1,
    EuropeWest1,
    AsiaNortheast1,
    Unknown,
}

impl Gen2Region {
    pub fn from_code(code: &str) -> Self {
        match code {
            "uc" => Self::UsCentral1,
            "uw" => Self::UsWest1,
            "ue" => Self::UsEast1,
            "ew" => Self::EuropeWest1,
            "an" => Self::AsiaNortheast1,
            _ => Self::Unknown,
        }
    }

    pub fn as_region(&self) -> Option<&'static str> {
        match self {
            Self::UsCentral1 => Some("us-central1"),
            Self::UsWest1 => Some("us-west1"),
            Self::UsEast1 => Some("us-east1"),
            Self::EuropeWest1 => Some("europe-west1"),
            Self::AsiaNortheast1 => Some("asia-northeast1"),
            Self::Unknown => None,
        }
    }
}

fn gen1_host() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z]+(?:-[a-z]+)*\d)-([a-z0-9-]+)\.cloudfunctions\.net$")
            .expect("valid gen1 host regex")
    })
}

fn gen2_host() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+)-([a-z0-9]+)-([a-z]{2})\.a\.run\.app$").expect("valid gen2 host regex")
    })
}

/// Cloud console logs page for a function URL.
///
/// Falls back to the console root when region or function can't be told
/// from the URL; `None` when it isn't a GCP URL at all.
pub fn console_url(function_url: &Url) -> Option<String> {
    let host = function_url.host_str()?;
    let mut region = None;
    let mut function = None;
    let mut project = None;

    if host.ends_with(GCP_GEN1_DOMAIN) {
        if let Some(caps) = gen1_host().captures(host) {
            region = Some(caps[1].to_string());
            project = Some(caps[2].to_string());
            function = Some(function_url.path().trim_start_matches('/').to_string());
        }
    } else if host.ends_with(GCP_GEN2_DOMAIN) {
        if let Some(caps) = gen2_host().captures(host) {
            region = Gen2Region::from_code(&caps[3]).as_region().map(str::to_string);
            function = Some(caps[1].to_string());
        }
    } else {
        return None;
    }

    let mut url = CONSOLE_ROOT.to_string();
    match (region, function) {
        (Some(region), Some(function)) if !region.is_empty() && !function.is_empty() => {
            url.push_str(&format!("/run/detail/{}/{}/logs", region, function));
            if let Some(project) = project.filter(|p| !p.is_empty()) {
                url.push_str(&format!("?project={}", project));
            }
        }
        _ => {}
    }
    Some(url)
}

/// Which function's logs to read.
#[derive(Debug, Clone)]
pub struct GcpLogsOptions {
    pub project_id: String,
    pub function_name: String,
    /// Function URL, only used to build the console link.
    pub url: Option<Url>,
}

impl GcpLogsOptions {
    pub fn new(project_id: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            function_name: function_name.into(),
            url: None,
        }
    }

    /// Entries from either a Gen1 function or a Gen2 service of that name.
    pub fn filter(&self) -> String {
        format!(
            "(resource.type=\"cloud_function\" AND resource.labels.function_name=\"{name}\") \
             OR (resource.type=\"cloud_run_revision\" AND resource.labels.service_name=\"{name}\")",
            name = self.function_name
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    text_payload: Option<String>,
    #[serde(default)]
    json_payload: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ListEntriesResponse {
    #[serde(default)]
    entries: Vec<LogEntry>,
}

/// Newest entries for the function, returned oldest first.
pub async fn fetch_logs(client: &ProxyClient, options: &GcpLogsOptions) -> HarnessResult<LogReport> {
    let token = client.gcp_tokens().access_token().await?;
    let endpoint = client
        .endpoints()
        .cloud_logging
        .clone()
        .unwrap_or_else(|| LOGGING_ENDPOINT.to_string());

    let filter = options.filter();
    debug!(project = %options.project_id, filter = %filter, "listing log entries");

    let response = client
        .http()
        .post(format!("{}/v2/entries:list", endpoint.trim_end_matches('/')))
        .bearer_auth(&token)
        .json(&json!({
            "resourceNames": [format!("projects/{}", options.project_id)],
            "filter": filter,
            "orderBy": "timestamp desc",
            "pageSize": LOG_PAGE_SIZE,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HarnessError::InvalidResponse {
            message: format!(
                "unable to list log entries for {}: HTTP {}: {}",
                options.function_name, status, body
            ),
        });
    }

    let listed: ListEntriesResponse = response.json().await?;
    let events = listed
        .entries
        .into_iter()
        .rev()
        .map(|entry| {
            let payload = match (entry.text_payload, entry.json_payload) {
                (Some(text), _) => Value::String(text),
                (None, Some(json)) => json,
                (None, None) => Value::Null,
            };
            classify_gcp_entry(
                entry.timestamp.unwrap_or_default(),
                entry.severity.as_deref(),
                &payload,
            )
        })
        .collect();

    Ok(LogReport {
        source: Some(format!("projects/{}", options.project_id)),
        events,
        console_url: options.url.as_ref().and_then(console_url),
    })
}

/// Force a Cloud Scheduler job to run now.
pub async fn run_scheduler_job(client: &ProxyClient, job_name: &str) -> HarnessResult<()> {
    info!(job = %job_name, "triggering Cloud Scheduler job");
    let access_token = client.gcp_tokens().access_token().await?;
    let endpoint = client
        .endpoints()
        .cloud_scheduler
        .clone()
        .unwrap_or_else(|| SCHEDULER_ENDPOINT.to_string());

    let response = client
        .http()
        .post(format!(
            "{}/v1/{}:run",
            endpoint.trim_end_matches('/'),
            job_name.trim_matches('/')
        ))
        .bearer_auth(&access_token)
        .json(&json!({}))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HarnessError::InvalidResponse {
            message: format!("unable to run scheduler job {}: HTTP {}: {}", job_name, status, body),
        });
    }
    info!(job = %job_name, "Cloud Scheduler job triggered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_gen1_console_url_carries_project() {
        assert_eq!(
            console_url(&url("https://us-central1-acme-psoxy.cloudfunctions.net/psoxy-gcal")).unwrap(),
            "https://console.cloud.google.com/run/detail/us-central1/psoxy-gcal/logs?project=acme-psoxy"
        );
    }

    #[test]
    fn test_gen2_console_url_uses_region_table() {
        assert_eq!(
            console_url(&url("https://psoxy-dev-gcal-boff2f476q-uc.a.run.app/")).unwrap(),
            "https://console.cloud.google.com/run/detail/us-central1/psoxy-dev-gcal/logs"
        );
    }

    #[test]
    fn test_unknown_region_code_falls_back_to_console_root() {
        assert_eq!(Gen2Region::from_code("zz"), Gen2Region::Unknown);
        assert_eq!(
            console_url(&url("https://psoxy-gcal-abc123-zz.a.run.app/")).unwrap(),
            "https://console.cloud.google.com"
        );
        assert_eq!(console_url(&url("https://example.com/")), None);
    }

    #[test]
    fn test_logs_filter_covers_both_generations() {
        let filter = GcpLogsOptions::new("acme", "psoxy-gcal").filter();
        assert!(filter.contains("resource.type=\"cloud_function\""));
        assert!(filter.contains("resource.labels.service_name=\"psoxy-gcal\""));
    }
}
