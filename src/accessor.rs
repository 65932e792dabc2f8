//! C1: resolves a `(source, name)` locator against a `ParsedRequest`.
//!
//! `name` is a dot-separated path into the payload tree, with an optional
//! bare integer segment for list indexing (`commits.0.author.email`). A
//! lone segment selects a root key. Header/query/request/context/string
//! sources are flat and never path-walked beyond a single lookup.

use crate::hook::SourceKind;
use crate::request::ParsedRequest;
use serde_json::Value;

/// Outcome of resolving a locator: either a concrete value (string or
/// subtree) or the distinguished "not found" condition. Never a hard
/// error and never a panic (spec: accessor totality).
#[derive(Debug, Clone)]
pub enum Accessed {
    Value(Value),
    NotFound,
}

impl Accessed {
    pub fn is_found(&self) -> bool {
        matches!(self, Accessed::Value(_))
    }

    /// Renders the resolved value as a string for equality/regex matching.
    /// Objects, arrays and null never compare equal to anything under
    /// `value`/`regex` rules — they simply fail to match.
    pub fn as_match_str(&self) -> Option<String> {
        match self {
            Accessed::Value(Value::String(s)) => Some(s.clone()),
            Accessed::Value(Value::Number(n)) => Some(n.to_string()),
            Accessed::Value(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Renders the resolved value as a string for use in command argv /
    /// environment values. Subtrees are JSON-encoded rather than dropped.
    pub fn as_command_str(&self) -> Option<String> {
        match self {
            Accessed::Value(Value::String(s)) => Some(s.clone()),
            Accessed::Value(Value::Number(n)) => Some(n.to_string()),
            Accessed::Value(Value::Bool(b)) => Some(b.to_string()),
            Accessed::Value(Value::Null) => Some(String::new()),
            Accessed::Value(v @ Value::Array(_)) | Accessed::Value(v @ Value::Object(_)) => {
                Some(v.to_string())
            }
            Accessed::NotFound => None,
        }
    }
}

fn split_segments(name: &str) -> Vec<&str> {
    if name.is_empty() {
        Vec::new()
    } else {
        name.split('.').collect()
    }
}

/// Walks a JSON tree following dot/index segments.
pub fn get_path<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segments {
        cur = match cur {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(arr) => {
                let idx: usize = seg.parse().ok()?;
                arr.get(idx)?
            }
            _ => return None,
        };
    }
    Some(cur)
}

/// Sets a value at a path, creating intermediate objects as needed.
/// Used by the `parse-parameters-as-json` substitution pass. Returns
/// `false` if an existing non-container value blocks the path.
pub fn set_path(root: &mut Value, segments: &[&str], new_value: Value) -> bool {
    if segments.is_empty() {
        *root = new_value;
        return true;
    }
    if !root.is_object() && !root.is_array() {
        *root = Value::Object(serde_json::Map::new());
    }
    let (head, rest) = (segments[0], &segments[1..]);
    match root {
        Value::Object(map) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            set_path(entry, rest, new_value)
        }
        Value::Array(arr) => {
            let Ok(idx) = head.parse::<usize>() else {
                return false;
            };
            if idx >= arr.len() {
                return false;
            }
            set_path(&mut arr[idx], rest, new_value)
        }
        _ => false,
    }
}

pub fn resolve(req: &ParsedRequest, source: SourceKind, name: &str) -> Accessed {
    match source {
        SourceKind::StringLiteral => Accessed::Value(Value::String(name.to_string())),
        SourceKind::Header => match req.header(name) {
            Some(v) => Accessed::Value(Value::String(v.to_string())),
            None => Accessed::NotFound,
        },
        SourceKind::Query => match req.query.get(name) {
            Some(v) => Accessed::Value(Value::String(v.clone())),
            None => Accessed::NotFound,
        },
        SourceKind::Url => match req.query.get(name) {
            Some(v) => Accessed::Value(Value::String(v.clone())),
            None => Accessed::NotFound,
        },
        SourceKind::Context => match req.context.get(name) {
            Some(v) => Accessed::Value(Value::String(v.clone())),
            None => Accessed::NotFound,
        },
        SourceKind::Payload => {
            let segments = split_segments(name);
            match get_path(&req.payload, &segments) {
                Some(v) => Accessed::Value(v.clone()),
                None => Accessed::NotFound,
            }
        }
        SourceKind::Request => match name {
            "method" => Accessed::Value(Value::String(req.method.to_string())),
            "remote-addr" => Accessed::Value(Value::String(req.remote_addr.clone())),
            "request-uri" => Accessed::Value(Value::String(req.raw_request_uri.clone())),
            "content-type" => Accessed::Value(Value::String(req.content_type.clone())),
            _ => Accessed::NotFound,
        },
        SourceKind::RawRequest => {
            Accessed::Value(Value::String(String::from_utf8_lossy(&req.body).into_owned()))
        }
        SourceKind::EntirePayload => Accessed::Value(Value::String(
            serde_json::to_string(&req.payload).unwrap_or_default(),
        )),
        SourceKind::EntireQuery => Accessed::Value(Value::String(
            serde_json::to_string(&req.query).unwrap_or_default(),
        )),
        SourceKind::EntireHeaders => Accessed::Value(Value::String(
            serde_json::to_string(&req.headers).unwrap_or_default(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ParsedRequest;
    use std::collections::HashMap;

    fn base_request() -> ParsedRequest {
        ParsedRequest {
            id: "req-1".into(),
            method: http::Method::POST,
            remote_addr: "127.0.0.1".into(),
            raw_request_uri: "/hooks/x".into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            payload: serde_json::json!({
                "ref": "refs/heads/main",
                "commits": [{"id": "abc", "author": {"email": "a@b.com"}}],
            }),
            body: b"{}".to_vec(),
            content_type: "application/json".into(),
            context: HashMap::new(),
        }
    }

    #[test]
    fn resolves_nested_path_with_index() {
        let req = base_request();
        let v = resolve(&req, SourceKind::Payload, "commits.0.id");
        assert_eq!(v.as_match_str(), Some("abc".to_string()));
        let v2 = resolve(&req, SourceKind::Payload, "commits.0.author.email");
        assert_eq!(v2.as_match_str(), Some("a@b.com".to_string()));
    }

    #[test]
    fn missing_path_is_not_found_not_error() {
        let req = base_request();
        let v = resolve(&req, SourceKind::Payload, "commits.5.id");
        assert!(!v.is_found());
    }

    #[test]
    fn string_source_is_a_literal() {
        let req = base_request();
        let v = resolve(&req, SourceKind::StringLiteral, "pong");
        assert_eq!(v.as_match_str(), Some("pong".to_string()));
    }

    #[test]
    fn entire_payload_is_json_encoded() {
        let req = base_request();
        let v = resolve(&req, SourceKind::EntirePayload, "");
        match v {
            Accessed::Value(Value::String(s)) => assert!(s.contains("\"ref\"")),
            _ => panic!("expected a JSON string"),
        }
    }
}
