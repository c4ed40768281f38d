//! Bulk file round-trip: upload to the input bucket, wait for the sanitized
//! copy in the output bucket, diff the two.

use std::path::{Path, PathBuf};

use chrono::Utc;
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::provider::ProxyClient;
use crate::storage::{download_with_retry, BucketStore};
use crate::transport::{gunzip, is_gzip};
use crate::types::UploadOptions;

/// Unified line diff between an original file and its sanitized copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    unified: String,
}

impl FileDiff {
    /// Empty when the two texts are identical.
    pub fn between(original: &str, sanitized: &str, original_name: &str, sanitized_name: &str) -> Self {
        if original == sanitized {
            return Self::default();
        }
        let diff = TextDiff::from_lines(original, sanitized);
        Self {
            unified: diff
                .unified_diff()
                .context_radius(3)
                .header(original_name, sanitized_name)
                .to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unified.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.unified
    }
}

/// Outcome of a round-trip.
#[derive(Debug, Clone)]
pub struct RoundTrip {
    /// Key used in both buckets.
    pub key: String,
    pub sanitized: String,
    pub diff: FileDiff,
    pub saved_to: Option<PathBuf>,
}

/// `<stem>-<millis><ext>`, so a download never picks up an older run.
pub fn timestamped_name(file: &Path, millis: i64) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match file.extension() {
        Some(ext) => format!("{}-{}.{}", stem, millis, ext.to_string_lossy()),
        None => format!("{}-{}", stem, millis),
    }
}

/// `<stem>-processed<ext>` next to the original.
pub fn processed_path(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match file.extension() {
        Some(ext) => format!("{}-processed.{}", stem, ext.to_string_lossy()),
        None => format!("{}-processed", stem),
    };
    file.with_file_name(name)
}

fn text_of(content: &[u8]) -> String {
    if is_gzip(content) {
        if let Ok(bytes) = gunzip(content) {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        debug!("file looks gzipped but does not decompress, diffing raw bytes");
    }
    String::from_utf8_lossy(content).into_owned()
}

/// Round-trip `options.file` through `store`.
pub async fn round_trip(
    store: &BucketStore,
    options: &UploadOptions,
    millis: i64,
) -> HarnessResult<RoundTrip> {
    let content = tokio::fs::read(&options.file)
        .await
        .map_err(|e| HarnessError::io(&options.file, e))?;

    let name = timestamped_name(&options.file, millis);
    let input_key = options.input.key_for(&name);
    let output_key = options.output.key_for(&name);

    info!(bucket = %options.input.bucket, key = %input_key, "Uploading file to input bucket");
    store.put(&options.input.bucket, &input_key, content.clone()).await?;
    info!("File uploaded");

    info!(bucket = %options.output.bucket, key = %output_key, "Downloading processed file from output bucket");
    let downloaded =
        download_with_retry(store, &options.output.bucket, &output_key, &options.retry).await?;
    info!("File downloaded");

    let original = text_of(&content);
    let sanitized = downloaded.decoded_text();
    let diff = FileDiff::between(
        &original,
        &sanitized,
        &options.file.display().to_string(),
        &format!("{}/{}", options.output.bucket, output_key),
    );

    if options.delete_output {
        match store.delete(&options.output.bucket, &output_key).await {
            Ok(()) => info!(key = %output_key, "Sanitized file deleted from output bucket"),
            Err(e) => warn!(key = %output_key, error = %e, "unable to delete sanitized file"),
        }
    }

    let saved_to = if options.save_sanitized {
        let path = processed_path(&options.file);
        info!(path = %path.display(), "Saving processed file");
        tokio::fs::write(&path, sanitized.as_bytes())
            .await
            .map_err(|e| HarnessError::io(&path, e))?;
        Some(path)
    } else {
        None
    };

    Ok(RoundTrip {
        key: name,
        sanitized,
        diff,
        saved_to,
    })
}

/// Round-trip through the provider's object store.
pub async fn run_upload(client: &ProxyClient, options: &UploadOptions) -> HarnessResult<RoundTrip> {
    if options.role.is_some() {
        debug!(role = ?options.role, "assuming role for bucket access");
    }
    let store = client
        .bucket_store(options.provider, options.role.as_deref(), options.region.as_deref())
        .await?;
    round_trip(&store, options, Utc::now().timestamp_millis()).await
}
