use super::super::args::UploadArgs;
use super::{build_client, EXIT_SUCCESS};
use anyhow::Context;
use psoxy_test_core::{run_upload, RetryPolicy, UploadOptions, DEFAULT_REQUEST_TIMEOUT};
use std::time::Duration;
use tracing::info;

pub async fn run(args: UploadArgs) -> anyhow::Result<i32> {
    let options = upload_options(&args);
    let client = build_client(DEFAULT_REQUEST_TIMEOUT)?;
    info!(
        provider = %options.provider,
        input = %options.input.bucket,
        output = %options.output.bucket,
        "Starting bulk round-trip"
    );

    let result = run_upload(&client, &options)
        .await
        .with_context(|| format!("round-trip of {} failed", options.file.display()))?;

    if result.diff.is_empty() {
        println!("{}: sanitized file is identical to the original", result.key);
    } else {
        println!("{}", result.diff.as_str());
    }
    if let Some(path) = &result.saved_to {
        println!("Sanitized file saved to: {}", path.display());
    }
    Ok(EXIT_SUCCESS)
}

fn upload_options(args: &UploadArgs) -> UploadOptions {
    let mut options = UploadOptions::new(args.deploy, &args.file, &args.input, &args.output);
    options.role = args.role.clone();
    options.region = args.region.clone();
    options.delete_output = args.delete_output;
    options.save_sanitized = args.save_sanitized;
    options.retry = RetryPolicy::new(args.attempts, Duration::from_secs(args.delay));
    options
}
