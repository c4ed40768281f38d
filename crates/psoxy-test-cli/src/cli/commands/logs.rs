use super::super::args::LogsArgs;
use super::{build_client, EXIT_SUCCESS};
use anyhow::Context;
use psoxy_test_core::provider::{aws, gcp};
use psoxy_test_core::{AwsLogsOptions, GcpLogsOptions, LogReport, DEFAULT_REQUEST_TIMEOUT};
use url::Url;

pub async fn run(args: LogsArgs) -> anyhow::Result<i32> {
    let client = build_client(DEFAULT_REQUEST_TIMEOUT)?;

    let report = match (&args.log_group, &args.project_id, &args.function_name) {
        (Some(log_group), _, _) => {
            let mut options = AwsLogsOptions::new(log_group);
            options.role = args.role.clone();
            if let Some(region) = &args.region {
                options.region = region.clone();
            }
            aws::fetch_logs(&client, &options)
                .await
                .with_context(|| format!("unable to get logs for {}", log_group))?
        }
        (None, Some(project), Some(function)) => {
            let mut options = GcpLogsOptions::new(project, function);
            options.url = args
                .url
                .as_deref()
                .map(Url::parse)
                .transpose()
                .context("invalid --url")?;
            gcp::fetch_logs(&client, &options)
                .await
                .with_context(|| format!("unable to get logs for {}", function))?
        }
        _ => anyhow::bail!(
            "either --log-group-name (AWS) or --project-id with --function-name (GCP) is required"
        ),
    };

    print_report(&report);
    Ok(EXIT_SUCCESS)
}

fn print_report(report: &LogReport) {
    if let Some(source) = &report.source {
        println!("Log events from {}", source);
    }
    if report.events.is_empty() {
        println!("Logs seem to be set correctly, but no events were found");
    }
    for event in &report.events {
        println!("{}", render_event_line(event));
    }
    if let Some(url) = &report.console_url {
        println!("Full logs: {}", url);
    }
}

fn render_event_line(event: &psoxy_test_core::LogEvent) -> String {
    let marker = if event.highlight { "!" } else { " " };
    let timestamp = event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    match &event.level {
        Some(level) => format!("{} {} [{}] {}", marker, timestamp, level, event.message),
        None => format!("{} {} {}", marker, timestamp, event.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use psoxy_test_core::LogEvent;

    #[test]
    fn test_highlighted_events_are_marked() {
        let event = LogEvent {
            timestamp: chrono::Utc.timestamp_millis_opt(0).unwrap(),
            level: Some("SEVERE".into()),
            message: "disk full".into(),
            highlight: true,
        };
        assert_eq!(
            render_event_line(&event),
            "! 1970-01-01 00:00:00.000 [SEVERE] disk full"
        );

        let plain = LogEvent {
            level: None,
            highlight: false,
            message: "started".into(),
            ..event
        };
        assert_eq!(render_event_line(&plain), "  1970-01-01 00:00:00.000 started");
    }
}
