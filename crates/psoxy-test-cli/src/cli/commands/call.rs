use super::super::args::{CallArgs, HttpMethod};
use super::{build_client, EXIT_FAILURE, EXIT_SUCCESS};
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use psoxy_test_core::{
    poll_async_response, run_data_source, verify_collection, CallOptions, MatchKind, HarnessError,
    ProxyClient, ProxyResponse, ASYNC_POLICY,
};
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub async fn run(args: CallArgs, verbose: bool) -> anyhow::Result<i32> {
    let options = call_options(&args, verbose)?;
    let client = build_client(options.timeout)?;

    if let Some(data_source) = &options.data_source {
        return run_walk(&client, data_source, &options, &args.output_dir, verbose).await;
    }

    let started_at = Utc::now();
    let response = client.call(&options).await?;

    if options.async_processing && response.async_location().is_none() {
        warn!("async processing requested but the proxy answered synchronously");
    }

    let ok = if let Some(location) = response.async_location() {
        let location = location.to_string();
        println!("Async processing accepted; result will be written to {}", location);
        let body = poll_async_response(&client, &location, &options, &ASYNC_POLICY).await?;
        println!("Async result:\n{}", pretty(&body));
        true
    } else {
        present(&response, &options, &args.output_dir, verbose).await?
    };

    if ok && options.verify_collection.is_some() {
        verify(&client, &options, started_at).await?;
    }

    Ok(if ok { EXIT_SUCCESS } else { EXIT_FAILURE })
}

fn call_options(args: &CallArgs, verbose: bool) -> anyhow::Result<CallOptions> {
    let mut options = CallOptions::new(&args.url)?;
    if let Some(body) = &args.body {
        options = options.with_body_json(body)?;
    }
    if let Some(method) = args.method {
        options = options.with_method(match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        });
    }

    options.force = args.force;
    options.impersonate = args.impersonate.clone();
    options.role = args.role.clone();
    options.region = args.region.clone();
    options.token = args.token.clone();
    options.skip = args.skip;
    options.gzip = args.gzip;
    options.health_check = args.health_check;
    options.request_no_response = args.request_no_response;
    options.async_processing = args.async_processing;
    options.signing_key = args.signing_key.clone();
    options.identity_issuer = args.identity_issuer.clone();
    options.identity_subject = args.identity_subject.clone();
    options.verbose = verbose;
    options.save_to_file = args.save_to_file;
    options.data_source = args.data_source.clone();
    options.verify_collection = args.verify_collection.clone();
    options.scheduler_job = args.scheduler_job.clone();
    options.timeout = Duration::from_secs(args.timeout);

    options.validate()?;
    Ok(options)
}

/// Print one call's outcome; true on HTTP 200.
async fn present(
    response: &ProxyResponse,
    options: &CallOptions,
    output_dir: &Path,
    verbose: bool,
) -> anyhow::Result<bool> {
    if verbose {
        print_headers(response);
    }

    if response.is_ok() {
        let prefix = if options.health_check {
            "Health Check result:"
        } else {
            "Call result:"
        };
        println!("{} {}", prefix, response.status_message());

        if let Some(json) = response.json() {
            let rendered = serde_json::to_string_pretty(&json)?;
            if options.save_to_file {
                let path = save_to_file(output_dir, &url_stem(&options.url), &rendered).await?;
                println!("Results saved to: {}", path.display());
            } else {
                println!("{}", rendered);
            }
        } else if !response.body.is_empty() {
            println!("{}", response.body);
        }
        return Ok(true);
    }

    let diagnosis = response.diagnose();
    match diagnosis.status {
        Some(status) => eprintln!("{}\n{}", status, diagnosis.message),
        None => eprintln!("{}", diagnosis.message),
    }
    if diagnosis.check_logs {
        eprintln!("This looks like an internal error in the Proxy; please review the logs.");
    }
    Ok(false)
}

fn print_headers(response: &ProxyResponse) {
    if response.headers.is_empty() {
        return;
    }
    println!("Response headers:");
    for (name, value) in &response.headers {
        println!("  {}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
}

fn pretty(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| serde_json::to_string_pretty(&json).ok())
        .unwrap_or_else(|| body.to_string())
}

/// URL path with dashes for slashes.
fn url_stem(url: &Url) -> String {
    url.path().trim_start_matches('/').replace('/', "-")
}

/// `<data source>-<endpoint name, lowercased and dashed>`
fn endpoint_stem(data_source: &str, endpoint: &str) -> String {
    let name: Vec<String> = endpoint
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    format!("{}-{}", data_source, name.join("-"))
}

/// `<stem>-<ISO timestamp>.json`
pub(crate) fn file_name_for(stem: &str, timestamp: &str) -> String {
    format!("{}-{}.json", stem, timestamp)
}

async fn save_to_file(dir: &Path, stem: &str, content: &str) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let path = dir.join(file_name_for(stem, &timestamp));
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

async fn run_walk(
    client: &ProxyClient,
    data_source: &str,
    options: &CallOptions,
    output_dir: &Path,
    verbose: bool,
) -> anyhow::Result<i32> {
    info!(data_source = %data_source, "Calling all endpoints of data source");
    let results = run_data_source(client, data_source, options).await?;

    let mut failed = 0usize;
    for (name, response) in &results {
        println!("{}: {}", name, response.status_message());
        if verbose {
            print_headers(response);
        }
        if response.is_ok() && options.save_to_file {
            if let Some(path) = save_walk_response(output_dir, data_source, name, response).await? {
                println!("  saved to: {}", path.display());
            }
        }
        if !response.is_ok() {
            failed += 1;
            warn!(endpoint = %name, status = ?response.status, "endpoint call failed");
            let diagnosis = response.diagnose();
            println!("  {}", diagnosis.message);
        }
    }

    println!(
        "{}: {} of {} endpoints OK",
        data_source,
        results.len() - failed,
        results.len()
    );
    Ok(if failed == 0 { EXIT_SUCCESS } else { EXIT_FAILURE })
}

/// Pretty JSON of one walked endpoint; non-JSON bodies are not saved.
async fn save_walk_response(
    output_dir: &Path,
    data_source: &str,
    endpoint: &str,
    response: &ProxyResponse,
) -> anyhow::Result<Option<PathBuf>> {
    let Some(json) = response.json() else {
        return Ok(None);
    };
    let rendered = serde_json::to_string_pretty(&json)?;
    let path = save_to_file(output_dir, &endpoint_stem(data_source, endpoint), &rendered).await?;
    Ok(Some(path))
}

async fn verify(
    client: &ProxyClient,
    options: &CallOptions,
    started_at: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    match verify_collection(client, options, started_at).await {
        Ok(verified) => {
            let how = match verified.match_kind {
                MatchKind::Exact => "exact match",
                MatchKind::IgnoringActorId => "match ignoring actor.id",
            };
            println!("Collection verified: {} ({})", verified.key, how);
            Ok(())
        }
        Err(e) => {
            if let HarnessError::Verification {
                expected, found, ..
            } = &e
            {
                if let Some(expected) = expected {
                    eprintln!("Expected content:\n{}", expected);
                }
                match found {
                    Some(found) => eprintln!("Last content found:\n{}", found),
                    None => eprintln!("No new content found"),
                }
            }
            Err(e).context("collection verification failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{Cli, Command};
    use clap::Parser;
    use psoxy_test_core::{Catalog, GcpTokenSource, Provider, Transport};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parse_call(argv: &[&str]) -> CallArgs {
        let mut full = vec!["psoxy-test", "call"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).cmd {
            Command::Call(args) => args,
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_file_name_from_url_path() {
        let url = Url::parse("https://x.run.app/calendar/v3/users/me/settings?a=1").unwrap();
        assert_eq!(
            file_name_for(&url_stem(&url), "2024-01-02T03:04:05.006Z"),
            "calendar-v3-users-me-settings-2024-01-02T03:04:05.006Z.json"
        );
    }

    #[test]
    fn test_endpoint_stem_is_dashed() {
        assert_eq!(endpoint_stem("gdrive", "File Details v2 API"), "gdrive-file-details-v2-api");
        assert_eq!(endpoint_stem("slack", "Conversations: History"), "slack-conversations-history");
    }

    #[test]
    fn test_call_options_from_args() {
        let args = parse_call(&[
            "-u",
            "https://psoxy-gcal-abc-uc.a.run.app/calendar/v3/users/me/settings",
            "-i",
            "alice@acme.com",
            "-m",
            "POST",
            "-b",
            r#"{"a":1}"#,
            "--timeout",
            "5",
        ]);
        let options = call_options(&args, true).unwrap();
        assert_eq!(options.impersonate.as_deref(), Some("alice@acme.com"));
        assert_eq!(options.method, Some(Method::POST));
        assert_eq!(options.body, Some(serde_json::json!({"a": 1})));
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert!(options.gzip);
        assert!(options.verbose);
    }

    #[test]
    fn test_invalid_body_fails_before_any_call() {
        let args = parse_call(&["-u", "https://x.run.app/", "-b", "{not json"]);
        assert!(call_options(&args, false).is_err());
    }

    #[test]
    fn test_signing_key_needs_issuer() {
        let args = parse_call(&[
            "-u",
            "https://x.run.app/",
            "--signing-key",
            "gcp-kms:projects/p/locations/l/keyRings/r/cryptoKeys/k",
        ]);
        let err = call_options(&args, false).unwrap_err();
        assert!(err.to_string().contains("--identity-issuer"));
    }

    #[tokio::test]
    async fn test_save_to_file_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("responses");
        let url = Url::parse("https://x.run.app/v2/users").unwrap();

        let path = save_to_file(&out, &url_stem(&url), "{}").await.unwrap();
        assert!(path.starts_with(&out));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("v2-users-"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_walk_saves_each_ok_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar/v3/calendars/primary/events"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .with_priority(10)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut options = CallOptions::new(&format!("{}/", server.uri()))
            .unwrap()
            .with_force(Provider::Gcp);
        options.save_to_file = true;
        let client = ProxyClient::new(Transport::default(), Catalog::builtin().unwrap())
            .with_gcp_tokens(GcpTokenSource::fixed("identity", "access"));

        let code = run_walk(&client, "gcal", &options, dir.path(), false).await.unwrap();
        assert_eq!(code, EXIT_FAILURE);

        let mut saved: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        saved.sort();
        assert_eq!(saved.len(), 3);
        assert!(saved[0].starts_with("gcal-event-"));
        assert!(saved[1].starts_with("gcal-primary-"));
        assert!(saved[2].starts_with("gcal-settings-"));
        assert!(!saved.iter().any(|name| name.starts_with("gcal-events-")));
        let content = std::fs::read_to_string(dir.path().join(&saved[1])).unwrap();
        assert!(content.contains("\"ok\": true"));
    }
}
