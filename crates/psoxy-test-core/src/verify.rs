//! Webhook collection verification.
//!
//! After posting a payload to a webhook collector, the sanitized result lands
//! in a bucket some time later. We poll the bucket for objects newer than the
//! call and compare the newest one with what was sent, allowing `actor.id`
//! to differ since collectors pseudonymize it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::provider::{gcp, ProxyClient};
use crate::retry::{format_elapsed, poll_until_deadline, RetryError};
use crate::storage::{list_newer_than, BucketStore};
use crate::types::{CallOptions, Provider, VerifyOptions};

/// How the found content matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    /// Equal once `actor.id` is removed from both sides.
    IgnoringActorId,
}

/// Object that matched the expected content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedObject {
    pub key: String,
    pub match_kind: MatchKind,
}

/// Items of a collected object: the elements of an array, or the object
/// itself. `None` when the content is not JSON.
pub fn parse_items(content: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(content).ok()? {
        Value::Array(items) => Some(items),
        object @ Value::Object(_) => Some(vec![object]),
        _ => Some(Vec::new()),
    }
}

fn without_actor_id(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(actor) = value.get_mut("actor").and_then(Value::as_object_mut) {
        actor.remove("id");
    }
    value
}

/// First match of `expected` among `items`, strict equality first.
pub fn compare_content(expected: &Value, items: &[Value]) -> Option<MatchKind> {
    if items.iter().any(|item| item == expected) {
        return Some(MatchKind::Exact);
    }
    let relaxed = without_actor_id(expected);
    items
        .iter()
        .any(|item| without_actor_id(item) == relaxed)
        .then_some(MatchKind::IgnoringActorId)
}

/// What the newest object in the bucket turned out to be.
enum Inspection {
    NothingNew,
    Matched(VerifiedObject),
    /// Content that is not (yet) what we expect.
    Rejected(String),
}

async fn inspect_newest(store: &BucketStore, options: &VerifyOptions) -> HarnessResult<Inspection> {
    let newest = list_newer_than(store, &options.bucket, options.started_at)
        .await?
        .into_iter()
        .next();
    let Some(newest) = newest else {
        return Ok(Inspection::NothingNew);
    };

    info!(key = %newest.key, created = %newest.last_modified.to_rfc3339(), "New file found");
    let content = store.get(&options.bucket, &newest.key).await?.decoded_text();
    info!(content = %content, "Found content");

    let Some(items) = parse_items(&content) else {
        warn!(key = %newest.key, "content is not valid JSON, waiting for a newer object");
        return Ok(Inspection::Rejected(content));
    };
    if items.is_empty() {
        warn!(key = %newest.key, "file is empty or contains no items, waiting for a newer object");
        return Ok(Inspection::Rejected(content));
    }

    match compare_content(&options.expected, &items) {
        Some(match_kind) => {
            if match_kind == MatchKind::IgnoringActorId {
                info!("Match found with differing actor.id (likely pseudonymized)");
            }
            Ok(Inspection::Matched(VerifiedObject {
                key: newest.key,
                match_kind,
            }))
        }
        None => {
            warn!(key = %newest.key, "content does not match, waiting for a newer object");
            Ok(Inspection::Rejected(content))
        }
    }
}

/// Poll `options.bucket` until an object newer than `started_at` holds the
/// expected content, or the window closes.
///
/// A mismatched, empty or unparseable object doesn't end the wait: a later
/// write may still bring the right content. On timeout the error carries the
/// expected content and the last content seen.
pub async fn verify_bucket(
    store: &BucketStore,
    options: &VerifyOptions,
) -> HarnessResult<VerifiedObject> {
    info!(
        bucket = %options.bucket,
        "Verifying content in bucket. Will wait up to {}",
        format_elapsed(options.timeout)
    );

    let last_found: Mutex<Option<String>> = Mutex::new(None);

    let result = poll_until_deadline(
        options.timeout,
        options.interval,
        "Waiting for content to appear in bucket...",
        || {
            let last_found = &last_found;
            async move {
                inspect_newest(store, options)
                    .await
                    .map(|inspection| match inspection {
                        Inspection::NothingNew => None,
                        Inspection::Matched(verified) => Some(verified),
                        Inspection::Rejected(content) => {
                            if let Ok(mut last) = last_found.lock() {
                                *last = Some(content);
                            }
                            None
                        }
                    })
            }
        },
        |e: &HarnessError| !e.is_retryable(),
    )
    .await;

    match result {
        Ok(verified) => {
            info!(key = %verified.key, "Verification successful: content matches");
            Ok(verified)
        }
        Err(RetryError::Stopped(e)) => Err(e),
        Err(RetryError::Exhausted { .. }) => {
            let found = last_found.lock().ok().and_then(|mut last| last.take());
            let reason = if found.is_some() {
                "expected content not found in bucket; newest content did not match"
            } else {
                "expected content not found in bucket: no new files within timeout"
            };
            Err(HarnessError::Verification {
                reason: reason.to_string(),
                expected: serde_json::to_string_pretty(&options.expected).ok(),
                found,
            })
        }
    }
}

/// Full verification after a webhook call started at `started_at`.
///
/// On GCP the collector's Cloud Scheduler job can be forced to run first.
pub async fn verify_collection(
    client: &ProxyClient,
    call: &CallOptions,
    started_at: DateTime<Utc>,
) -> HarnessResult<VerifiedObject> {
    let bucket = call
        .verify_collection
        .clone()
        .ok_or_else(|| HarnessError::config("no bucket to verify"))?;
    let expected = call
        .body
        .clone()
        .ok_or_else(|| HarnessError::config("--verify-collection needs --body: it is the content to look for"))?;
    let provider = Provider::resolve(call)?;

    if let (Provider::Gcp, Some(job)) = (provider, call.scheduler_job.as_deref()) {
        gcp::run_scheduler_job(client, job).await?;
    }

    let store = client
        .bucket_store(provider, call.role.as_deref(), call.region.as_deref())
        .await?;
    let mut options = VerifyOptions::new(provider, bucket, expected, started_at);
    options.scheduler_job = call.scheduler_job.clone();

    verify_bucket(&store, &options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_strict_match() {
        let items = vec![json!({"id": 1, "name": "foo"})];
        assert_eq!(
            compare_content(&json!({"id": 1, "name": "foo"}), &items),
            Some(MatchKind::Exact)
        );
        assert_eq!(compare_content(&json!({"id": 1, "name": "bar"}), &items), None);
        assert_eq!(compare_content(&json!({"id": 1}), &[]), None);
    }

    #[test]
    fn test_relaxed_match_ignores_actor_id() {
        let items = vec![json!({"actor": {"id": "generated-id", "name": "user"}, "action": "login"})];
        let expected = json!({"actor": {"id": "original-id", "name": "user"}, "action": "login"});
        assert_eq!(
            compare_content(&expected, &items),
            Some(MatchKind::IgnoringActorId)
        );

        let other_action = json!({"actor": {"id": "original-id", "name": "user"}, "action": "logout"});
        assert_eq!(compare_content(&other_action, &items), None);
    }

    #[test]
    fn test_parse_items() {
        assert_eq!(parse_items(r#"[{"a":1},{"b":2}]"#).unwrap().len(), 2);
        assert_eq!(parse_items(r#"{"a":1}"#).unwrap().len(), 1);
        assert!(parse_items("42").unwrap().is_empty());
        assert!(parse_items("not json").is_none());
    }

    fn options(expected: Value, started_at: DateTime<Utc>, timeout_ms: u64) -> VerifyOptions {
        let mut options = VerifyOptions::new(Provider::Aws, "collected", expected, started_at);
        options.timeout = Duration::from_millis(timeout_ms);
        options.interval = Duration::from_millis(5);
        options
    }

    /// Put `content` and make sure the clock moves past its timestamp.
    async fn put(store: &BucketStore, key: &str, content: &[u8]) {
        store.put("collected", key, content.to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn started() -> DateTime<Utc> {
        let now = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        now
    }

    #[tokio::test]
    async fn test_verify_finds_newest_matching_object() {
        let store = BucketStore::in_memory();
        put(&store, "old.json", br#"{"event":"x"}"#).await;
        let started = started().await;
        put(&store, "new.json", br#"[{"event":"x"}]"#).await;

        let verified = verify_bucket(&store, &options(json!({"event": "x"}), started, 500))
            .await
            .unwrap();
        assert_eq!(verified.key, "new.json");
        assert_eq!(verified.match_kind, MatchKind::Exact);
    }

    #[tokio::test]
    async fn test_mismatch_keeps_polling_then_reports_last_found() {
        let store = BucketStore::in_memory();
        let started = started().await;
        put(&store, "new.json", br#"{"event":"y"}"#).await;

        let err = verify_bucket(&store, &options(json!({"event": "x"}), started, 40))
            .await
            .unwrap_err();
        match err {
            HarnessError::Verification { expected, found, .. } => {
                assert!(expected.unwrap().contains("\"x\""));
                assert_eq!(found.as_deref(), Some(r#"{"event":"y"}"#));
            }
            other => panic!("expected verification failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nothing_new_times_out_without_found_content() {
        let store = BucketStore::in_memory();
        put(&store, "old.json", br#"{"event":"x"}"#).await;
        let started = started().await;

        let err = verify_bucket(&store, &options(json!({"event": "x"}), started, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Verification { found: None, .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
