//! Multi-step walk over a data source's endpoints.
//!
//! Endpoints run in declaration order. After each 200 response, the refs of
//! that endpoint pull values out of the body and stash them in a per-run
//! [`ResolvedValues`]; later endpoints are materialized from their immutable
//! template plus whatever has been resolved for them so far.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::{EndpointSpec, Ref, Replacement};
use crate::error::{HarnessError, HarnessResult};
use crate::provider::ProxyClient;
use crate::response::ProxyResponse;
use crate::types::CallOptions;

/// Values resolved for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointValues {
    pub path_tokens: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
}

/// Values resolved during one run, keyed by target endpoint name.
#[derive(Debug, Clone, Default)]
pub struct ResolvedValues {
    values: BTreeMap<String, EndpointValues>,
}

impl ResolvedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_endpoint(&self, name: &str) -> Option<&EndpointValues> {
        self.values.get(name)
    }

    pub fn set(&mut self, target: &str, replacement: &Replacement, value: String) {
        let entry = self.values.entry(target.to_string()).or_default();
        match replacement {
            Replacement::PathToken(token) => {
                entry.path_tokens.insert(token.clone(), value);
            }
            Replacement::Param(param) => {
                entry.params.insert(param.clone(), value);
            }
        }
    }

    /// Apply `refs` against a parsed response body. Returns how many were set.
    pub fn apply_refs(&mut self, refs: &[Ref], body: &Value) -> usize {
        let mut applied = 0;
        for r in refs {
            match r.accessor.extract(body) {
                Some(value) => {
                    debug!(endpoint = %r.target, accessor = %r.accessor, value = %value, "ref resolved");
                    self.set(&r.target, &r.replacement, value);
                    applied += 1;
                }
                None => warn!(
                    endpoint = %r.target,
                    accessor = %r.accessor,
                    "no value at accessor, {} will be called unresolved",
                    r.target
                ),
            }
        }
        applied
    }
}

fn unresolved_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[A-Za-z0-9_]+\]").expect("valid token regex"))
}

/// Escaped in resolved values so each stays a single path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn render_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Path with resolved tokens substituted, each value percent-encoded as a
/// path segment.
pub fn materialize_path(endpoint: &EndpointSpec, resolved: Option<&EndpointValues>) -> String {
    let mut path = endpoint.path.clone();
    if let Some(resolved) = resolved {
        for (token, value) in &resolved.path_tokens {
            let encoded = utf8_percent_encode(value, PATH_SEGMENT).to_string();
            path = path.replace(token.as_str(), &encoded);
        }
    }
    path
}

/// Query pairs: declared params in order with resolved values overriding,
/// then resolved params the template doesn't declare. Params still `null`
/// are left out.
pub fn materialize_params(
    endpoint: &EndpointSpec,
    resolved: Option<&EndpointValues>,
) -> Vec<(String, String)> {
    let overrides = resolved.map(|r| &r.params);
    let mut pairs = Vec::with_capacity(endpoint.params.len());

    for (name, value) in &endpoint.params {
        let rendered = overrides
            .and_then(|o| o.get(name).cloned())
            .or_else(|| value.as_ref().map(render_param));
        match rendered {
            Some(v) => pairs.push((name.clone(), v)),
            None => debug!(param = %name, "omitting unresolved param"),
        }
    }

    if let Some(overrides) = overrides {
        for (name, value) in overrides {
            if !endpoint.params.iter().any(|(declared, _)| declared == name) {
                pairs.push((name.clone(), value.clone()));
            }
        }
    }
    pairs
}

/// Full URL for `endpoint` below the proxy `base` URL.
pub fn endpoint_url(
    base: &Url,
    endpoint: &EndpointSpec,
    resolved: Option<&EndpointValues>,
) -> HarnessResult<Url> {
    let mut root = base.clone();
    root.set_query(None);
    root.set_fragment(None);
    let root = root.as_str().trim_end_matches('/').to_string();

    let path = materialize_path(endpoint, resolved);
    let joined = format!("{}{}", root, path);
    let mut url = Url::parse(&joined).map_err(|_| HarnessError::InvalidUrl { input: joined })?;

    let params = materialize_params(endpoint, resolved);
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}

/// Call every endpoint of data source `name`, in declaration order.
///
/// Failures of individual calls don't stop the walk; a missing value only
/// means later endpoints go out with their tokens unresolved.
pub async fn run_data_source(
    client: &ProxyClient,
    name: &str,
    base_options: &CallOptions,
) -> HarnessResult<Vec<(String, ProxyResponse)>> {
    let source = client.catalog().get(name)?;
    info!(data_source = %source.id, endpoints = source.endpoints.len(), "Calling all endpoints for {}", source.name);

    let mut resolved = ResolvedValues::new();
    let mut results = Vec::with_capacity(source.endpoints.len());

    for endpoint in &source.endpoints {
        let url = endpoint_url(&base_options.url, endpoint, resolved.for_endpoint(&endpoint.name))?;
        if unresolved_token().is_match(url.path()) {
            warn!(endpoint = %endpoint.name, path = %url.path(), "path has unresolved tokens");
        }

        let mut options = base_options.for_url(url);
        if options.method.is_none() {
            options.method = endpoint.method.clone();
        }
        // Endpoints carry no body of their own.
        options.body = None;

        info!(endpoint = %endpoint.name, url = %options.url, "calling endpoint");
        let response = client.call(&options).await?;

        if response.is_ok() && !endpoint.refs.is_empty() {
            match response.json() {
                Some(body) => {
                    resolved.apply_refs(&endpoint.refs, &body);
                }
                None => warn!(endpoint = %endpoint.name, "response is not JSON, refs skipped"),
            }
        }
        results.push((endpoint.name.clone(), response));
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use serde_json::json;

    fn gcal() -> Vec<EndpointSpec> {
        Catalog::builtin().unwrap().get("gcal").unwrap().endpoints.clone()
    }

    #[test]
    fn test_refs_fill_path_token_of_target() {
        let endpoints = gcal();
        let events = endpoints.iter().find(|e| e.name == "Events").unwrap();
        let event = endpoints.iter().find(|e| e.name == "Event").unwrap();

        let mut resolved = ResolvedValues::new();
        let applied = resolved.apply_refs(&events.refs, &json!({"items": [{"id": "e1"}]}));
        assert_eq!(applied, 1);

        let base = Url::parse("https://psoxy-gcal-abc-uc.a.run.app/").unwrap();
        let url = endpoint_url(&base, event, resolved.for_endpoint("Event")).unwrap();
        assert_eq!(url.path(), "/calendar/v3/calendars/primary/events/e1");
        assert_eq!(event.path, "/calendar/v3/calendars/primary/events/[event_id]");
    }

    #[test]
    fn test_missing_value_leaves_token_in_place() {
        let endpoints = gcal();
        let events = endpoints.iter().find(|e| e.name == "Events").unwrap();
        let event = endpoints.iter().find(|e| e.name == "Event").unwrap();

        let mut resolved = ResolvedValues::new();
        assert_eq!(resolved.apply_refs(&events.refs, &json!({"items": []})), 0);
        assert_eq!(materialize_path(event, resolved.for_endpoint("Event")), event.path);
    }

    #[test]
    fn test_resolved_path_values_are_percent_encoded() {
        let endpoints = gcal();
        let event = endpoints.iter().find(|e| e.name == "Event").unwrap();

        let mut values = EndpointValues::default();
        values
            .path_tokens
            .insert("[event_id]".into(), "a/b c?d#e%f".into());
        assert_eq!(
            materialize_path(event, Some(&values)),
            "/calendar/v3/calendars/primary/events/a%2Fb%20c%3Fd%23e%25f"
        );

        let base = Url::parse("https://psoxy-gcal-abc-uc.a.run.app/").unwrap();
        let url = endpoint_url(&base, event, Some(&values)).unwrap();
        assert_eq!(url.path_segments().unwrap().count(), 6);
        assert_eq!(url.query(), None);

        values.path_tokens.insert("[event_id]".into(), "evt_1-x.y~z".into());
        assert!(materialize_path(event, Some(&values)).ends_with("/evt_1-x.y~z"));
    }

    #[test]
    fn test_null_params_omitted_and_resolved_params_override() {
        let endpoint = EndpointSpec {
            name: "History".into(),
            path: "/api/history".into(),
            params: vec![
                ("limit".into(), Some(json!(10))),
                ("channel".into(), None),
                ("oldest".into(), Some(json!("0"))),
            ],
            method: None,
            refs: Vec::new(),
        };
        assert_eq!(
            materialize_params(&endpoint, None),
            vec![("limit".to_string(), "10".to_string()), ("oldest".into(), "0".into())]
        );

        let mut values = EndpointValues::default();
        values.params.insert("channel".into(), "C1".into());
        values.params.insert("oldest".into(), "5".into());
        values.params.insert("cursor".into(), "abc".into());
        assert_eq!(
            materialize_params(&endpoint, Some(&values)),
            vec![
                ("limit".to_string(), "10".to_string()),
                ("channel".into(), "C1".into()),
                ("oldest".into(), "5".into()),
                ("cursor".into(), "abc".into()),
            ]
        );
    }

    #[test]
    fn test_endpoint_url_keeps_base_path_prefix() {
        let endpoint = EndpointSpec {
            name: "Users".into(),
            path: "/v2/users".into(),
            params: vec![("page_size".into(), Some(json!(5)))],
            method: None,
            refs: Vec::new(),
        };
        let base = Url::parse("https://x.execute-api.us-east-1.amazonaws.com/live/zoom/?ignored=1").unwrap();
        let url = endpoint_url(&base, &endpoint, None).unwrap();
        assert_eq!(
            url.as_str(),
            "https://x.execute-api.us-east-1.amazonaws.com/live/zoom/v2/users?page_size=5"
        );
    }
}
