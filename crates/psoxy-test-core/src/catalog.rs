//! Built-in data source catalogs.
//!
//! Loaded from an embedded YAML document and validated up front, so a bad ref
//! fails at load instead of halfway through a walk.

use std::collections::{BTreeMap, HashSet};

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::accessor::Accessor;
use crate::error::{HarnessError, HarnessResult};

const BUILTIN_CATALOG: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/catalogs/data-sources.yaml"
));

/// Where a ref writes its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    /// `[token]` inside the target path.
    PathToken(String),
    /// Query parameter of the target.
    Param(String),
}

/// Value flow from one endpoint's response into a later endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    pub target: String,
    pub accessor: Accessor,
    pub replacement: Replacement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub name: String,
    pub path: String,
    /// Declared query params, in order; `None` waits for a ref.
    pub params: Vec<(String, Option<Value>)>,
    pub method: Option<Method>,
    pub refs: Vec<Ref>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub endpoints: Vec<EndpointSpec>,
}

/// Data sources by id.
#[derive(Debug, Clone)]
pub struct Catalog {
    sources: BTreeMap<String, DataSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDataSource {
    name: String,
    endpoints: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEndpoint {
    name: String,
    path: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    refs: Vec<RawRef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRef {
    target: String,
    accessor: String,
    #[serde(default)]
    path_token: Option<String>,
    #[serde(default)]
    param: Option<String>,
}

impl Catalog {
    /// Catalog shipped with the binary.
    pub fn builtin() -> HarnessResult<Self> {
        Self::from_yaml(BUILTIN_CATALOG)
    }

    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let raw: BTreeMap<String, RawDataSource> =
            serde_yaml::from_str(yaml).map_err(|e| HarnessError::InvalidCatalog {
                data_source: "<catalog>".into(),
                reason: e.to_string(),
            })?;

        let mut sources = BTreeMap::new();
        for (id, source) in raw {
            let source = convert(&id, source)?;
            validate(&source)?;
            sources.insert(id, source);
        }
        Ok(Self { sources })
    }

    pub fn get(&self, id: &str) -> HarnessResult<&DataSource> {
        self.sources
            .get(id)
            .ok_or_else(|| HarnessError::UnknownDataSource { name: id.to_string() })
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Method declared by any endpoint whose template path equals `path`.
    pub fn method_for_path(&self, path: &str) -> Option<Method> {
        self.sources
            .values()
            .flat_map(|s| s.endpoints.iter())
            .find(|e| e.path == path)
            .and_then(|e| e.method.clone())
    }
}

fn convert(id: &str, raw: RawDataSource) -> HarnessResult<DataSource> {
    let invalid = |reason: String| HarnessError::InvalidCatalog {
        data_source: id.to_string(),
        reason,
    };

    let mut endpoints = Vec::with_capacity(raw.endpoints.len());
    for endpoint in raw.endpoints {
        let method = endpoint
            .method
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| invalid(format!("{}: invalid method {}", endpoint.name, m)))
            })
            .transpose()?;

        let mut refs = Vec::with_capacity(endpoint.refs.len());
        for r in endpoint.refs {
            let replacement = match (r.path_token, r.param) {
                (Some(token), None) => Replacement::PathToken(token),
                (None, Some(param)) => Replacement::Param(param),
                _ => {
                    return Err(invalid(format!(
                        "{} -> {}: a ref needs exactly one of path_token or param",
                        endpoint.name, r.target
                    )))
                }
            };
            let accessor = r
                .accessor
                .parse::<Accessor>()
                .map_err(|e| invalid(format!("{} -> {}: {}", endpoint.name, r.target, e)))?;
            refs.push(Ref {
                target: r.target,
                accessor,
                replacement,
            });
        }

        let params = endpoint
            .params
            .into_iter()
            .map(|(k, v)| (k, if v.is_null() { None } else { Some(v) }))
            .collect();

        endpoints.push(EndpointSpec {
            name: endpoint.name,
            path: endpoint.path,
            params,
            method,
            refs,
        });
    }

    Ok(DataSource {
        id: id.to_string(),
        name: raw.name,
        endpoints,
    })
}

/// Names unique; refs point forward to declared endpoints; path tokens exist
/// in the target path.
fn validate(source: &DataSource) -> HarnessResult<()> {
    let invalid = |reason: String| HarnessError::InvalidCatalog {
        data_source: source.id.clone(),
        reason,
    };

    let mut seen = HashSet::new();
    for endpoint in &source.endpoints {
        if !seen.insert(endpoint.name.as_str()) {
            return Err(invalid(format!("duplicate endpoint name {}", endpoint.name)));
        }
    }

    for (position, endpoint) in source.endpoints.iter().enumerate() {
        for r in &endpoint.refs {
            let target_position = source
                .endpoints
                .iter()
                .position(|e| e.name == r.target)
                .ok_or_else(|| {
                    invalid(format!("{} refers to undeclared endpoint {}", endpoint.name, r.target))
                })?;

            if target_position <= position {
                return Err(invalid(format!(
                    "{} refers to {}, which is declared before it",
                    endpoint.name, r.target
                )));
            }

            if let Replacement::PathToken(token) = &r.replacement {
                let target = &source.endpoints[target_position];
                if !target.path.contains(token.as_str()) {
                    return Err(invalid(format!(
                        "{} sets {} but {} has no such token in {}",
                        endpoint.name, token, target.name, target.path
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_loads_every_source() {
        let catalog = Catalog::builtin().unwrap();
        let ids: Vec<&str> = catalog.ids().collect();
        for expected in [
            "asana",
            "azure-ad",
            "dropbox-business",
            "gcal",
            "gdirectory",
            "gdrive",
            "gmail",
            "google-chat",
            "google-meet",
            "outlook-cal",
            "outlook-mail",
            "slack-discovery-api",
            "zoom",
        ] {
            assert!(ids.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_params_keep_declaration_order_and_nulls() {
        let catalog = Catalog::builtin().unwrap();
        let slack = catalog.get("slack-discovery-api").unwrap();
        let history = &slack.endpoints[3];
        assert_eq!(history.name, "Workspace Channel Messages");
        let names: Vec<&str> = history.params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["limit", "team", "channel"]);
        assert!(history.params[1].1.is_none());
    }

    #[test]
    fn test_method_lookup_by_exact_path() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(
            catalog.method_for_path("/2/team/members/list_v2"),
            Some(Method::POST)
        );
        assert_eq!(catalog.method_for_path("/v2/users"), None);
    }

    #[test]
    fn test_unknown_data_source() {
        let catalog = Catalog::builtin().unwrap();
        let err = catalog.get("nope").unwrap_err();
        assert_eq!(err.to_string(), "unknown data source: nope");
    }

    #[test]
    fn test_rejects_undeclared_target() {
        let yaml = r#"
demo:
  name: Demo
  endpoints:
    - name: List
      path: /items
      refs:
        - target: Missing
          accessor: items[0].id
          path_token: "[id]"
"#;
        let err = Catalog::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("undeclared endpoint Missing"));
    }

    #[test]
    fn test_rejects_backward_ref() {
        let yaml = r#"
demo:
  name: Demo
  endpoints:
    - name: Item
      path: /items/[id]
    - name: List
      path: /items
      refs:
        - target: Item
          accessor: items[0].id
          path_token: "[id]"
"#;
        let err = Catalog::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("declared before it"));
    }

    #[test]
    fn test_rejects_missing_path_token_and_double_replacement() {
        let missing = r#"
demo:
  name: Demo
  endpoints:
    - name: List
      path: /items
      refs:
        - target: Item
          accessor: items[0].id
          path_token: "[item_id]"
    - name: Item
      path: /items/[id]
"#;
        assert!(Catalog::from_yaml(missing).is_err());

        let both = r#"
demo:
  name: Demo
  endpoints:
    - name: List
      path: /items
      refs:
        - target: Item
          accessor: items[0].id
          path_token: "[id]"
          param: id
    - name: Item
      path: /items/[id]
"#;
        let err = Catalog::from_yaml(both).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }
}
