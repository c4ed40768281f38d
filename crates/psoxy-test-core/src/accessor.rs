//! Accessor paths into JSON responses: `items[0].id`, `enterprise.teams[0].id`.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parsed accessor path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessor {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid accessor \"{input}\": {reason}")]
pub struct AccessorError {
    pub input: String,
    pub reason: String,
}

impl Accessor {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Value at this path, if every step exists.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |current, segment| match segment {
                Segment::Key(key) => current.get(key.as_str()),
                Segment::Index(i) => current.get(*i),
            })
    }

    /// Value at this path as replacement text.
    ///
    /// Strings, numbers and booleans render as text; null, empty strings and
    /// containers give `None`.
    pub fn extract(&self, root: &Value) -> Option<String> {
        match self.get(root)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl FromStr for Accessor {
    type Err = AccessorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| AccessorError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if input.trim().is_empty() {
            return Err(fail("empty path"));
        }

        let mut segments = Vec::new();
        for part in input.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => part.split_at(pos),
                None => (part, ""),
            };

            if key.is_empty() && rest.is_empty() {
                return Err(fail("empty segment"));
            }
            if key.contains(']') {
                return Err(fail("unbalanced brackets"));
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                let inner = rest
                    .strip_prefix('[')
                    .and_then(|r| r.split_once(']'))
                    .ok_or_else(|| fail("unbalanced brackets"))?;
                let index = inner
                    .0
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| fail("index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = inner.1;
            }
        }

        Ok(Self {
            source: input.to_string(),
            segments,
        })
    }
}

impl fmt::Display for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_dotted_and_indexed() {
        let accessor: Accessor = "enterprise.teams[0].id".parse().unwrap();
        assert_eq!(
            accessor.segments(),
            &[
                Segment::Key("enterprise".into()),
                Segment::Key("teams".into()),
                Segment::Index(0),
                Segment::Key("id".into()),
            ]
        );
        assert_eq!(accessor.to_string(), "enterprise.teams[0].id");

        let nested: Accessor = "matrix[1][2]".parse().unwrap();
        assert_eq!(nested.segments().len(), 3);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "items[", "items[x].id", "a..b", "items]0["] {
            assert!(bad.parse::<Accessor>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_extract_scalars() {
        let body = json!({"items": [{"id": "evt-1", "seq": 7, "ok": true, "none": null, "blank": ""}]});
        let get = |path: &str| path.parse::<Accessor>().unwrap().extract(&body);

        assert_eq!(get("items[0].id").as_deref(), Some("evt-1"));
        assert_eq!(get("items[0].seq").as_deref(), Some("7"));
        assert_eq!(get("items[0].ok").as_deref(), Some("true"));
        assert_eq!(get("items[0].none"), None);
        assert_eq!(get("items[0].blank"), None);
        assert_eq!(get("items[1].id"), None);
        assert_eq!(get("items"), None);
    }
}
