//! `ParsedRequest` (spec §3) and C5: decoding the raw HTTP request into it.

use crate::accessor;
use crate::hook::{Hook, SourceKind};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;

/// The structured, decoded form of an incoming HTTP request handed to the
/// rule evaluator and command assembler. Consumed once per request.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub id: String,
    pub method: http::Method,
    pub remote_addr: String,
    pub raw_request_uri: String,
    /// Keyed by lower-cased header name; first value wins.
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub payload: Value,
    pub body: Vec<u8>,
    pub content_type: String,
    /// Per-request scratch map the dispatcher may populate before rule
    /// evaluation (the `context` parameter source).
    pub context: HashMap<String, String>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A decode outcome carries a soft parse error: the request is still
/// usable (rule evaluation may still match on headers/query) even if the
/// body couldn't be decoded for the chosen content type.
pub struct ParseOutcome {
    pub request: ParsedRequest,
    pub parse_error: Option<String>,
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn effective_content_type(header_content_type: &str, hook: Option<&Hook>) -> String {
    if let Some(hook) = hook {
        if let Some(override_ct) = &hook.incoming_payload_content_type {
            return normalize_content_type(override_ct);
        }
    }
    normalize_content_type(header_content_type)
}

fn decode_json(body: &[u8]) -> (Value, Option<String>) {
    match serde_json::from_slice::<Value>(body) {
        Ok(v) => (v, None),
        Err(e) => (Value::Object(Default::default()), Some(format!("json decode error: {e}"))),
    }
}

fn decode_xml(body: &[u8]) -> (Value, Option<String>) {
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(e) => return (Value::Object(Default::default()), Some(format!("invalid utf-8 in xml body: {e}"))),
    };
    match quick_xml::de::from_str::<Value>(text) {
        Ok(v) => (v, None),
        Err(e) => (Value::Object(Default::default()), Some(format!("xml decode error: {e}"))),
    }
}

fn decode_form(body: &[u8]) -> (Value, Option<String>) {
    let mut map = serde_json::Map::new();
    for (k, v) in url::form_urlencoded::parse(body) {
        let (k, v) = (k.into_owned(), v.into_owned());
        match map.remove(&k) {
            None => {
                map.insert(k, Value::String(v));
            }
            Some(Value::Array(mut arr)) => {
                arr.push(Value::String(v));
                map.insert(k, Value::Array(arr));
            }
            Some(existing) => {
                map.insert(k, Value::Array(vec![existing, Value::String(v)]));
            }
        }
    }
    (Value::Object(map), None)
}

async fn decode_multipart(body: &[u8], content_type: &str, json_part_names: &[String], max_field_memory: usize) -> (Value, Option<String>) {
    let boundary = match multer::parse_boundary(content_type) {
        Ok(b) => b,
        Err(e) => return (Value::Object(Default::default()), Some(format!("multipart boundary error: {e}"))),
    };
    let stream = tokio_stream::once(Ok::<Bytes, std::io::Error>(Bytes::copy_from_slice(body)));
    let constraints = multer::Constraints::new().size_limit(multer::SizeLimit::new().per_field(max_field_memory as u64));
    let mut mp = multer::Multipart::with_constraints(stream, boundary, constraints);
    let mut map = serde_json::Map::new();
    loop {
        let field = match mp.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return (Value::Object(map), Some(format!("multipart field error: {e}"))),
        };
        let Some(name) = field.name().map(str::to_string) else { continue };
        let is_file = field.file_name().is_some();
        let is_json_content_type = field
            .content_type()
            .map(|m| m.essence_str() == "application/json")
            .unwrap_or(false);
        let wants_json = is_json_content_type || json_part_names.iter().any(|n| n == &name);
        let bytes = match field.bytes().await {
            Ok(b) => b,
            Err(e) => return (Value::Object(map), Some(format!("multipart field {name} too large: {e}"))),
        };
        if is_file && !wants_json {
            continue;
        }
        if wants_json {
            if let Ok(v) = serde_json::from_slice::<Value>(&bytes) {
                map.insert(name, v);
            }
        } else {
            map.insert(name, Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        }
    }
    (Value::Object(map), None)
}

/// Decodes a raw body into a payload tree, selecting the decoder from the
/// effective content type. Never fails the request: decode errors are
/// returned alongside an (empty-map) payload for logging only.
pub async fn decode_payload(
    content_type: &str,
    body: &[u8],
    json_part_names: &[String],
    max_multipart_memory: usize,
) -> (Value, Option<String>) {
    match content_type {
        "application/json" => decode_json(body),
        "application/xml" | "text/xml" => decode_xml(body),
        "application/x-www-form-urlencoded" => decode_form(body),
        ct if ct.starts_with("multipart/form-data") => decode_multipart(body, content_type, json_part_names, max_multipart_memory).await,
        _ => (Value::Object(Default::default()), None),
    }
}

/// Re-parses each `parse-parameters-as-json` locator's resolved string
/// value and substitutes the parsed tree back into the payload at the
/// same path (spec §4.C5 step 3).
pub fn apply_parse_parameters_as_json(req: &mut ParsedRequest, locators: &[crate::hook::ParamLocator]) {
    for locator in locators {
        let resolved = accessor::resolve(req, locator.source, &locator.name);
        let Some(s) = resolved.as_match_str() else { continue };
        let Ok(parsed) = serde_json::from_str::<Value>(&s) else { continue };
        if matches!(locator.source, SourceKind::Payload) {
            let segments: Vec<&str> = if locator.name.is_empty() {
                Vec::new()
            } else {
                locator.name.split('.').collect()
            };
            accessor::set_path(&mut req.payload, &segments, parsed);
        }
    }
}

/// C5: builds a `ParsedRequest` from the request head and a buffered body.
/// Body-size capping happens one layer up (HTTP surface), before this is
/// called, since an oversized body never reaches decoding (spec §4.C5.1).
pub async fn parse(
    id: String,
    method: http::Method,
    remote_addr: String,
    uri: &http::Uri,
    headers: &http::HeaderMap,
    body: Vec<u8>,
    hook: Option<&Hook>,
    max_multipart_memory: usize,
) -> ParseOutcome {
    let mut header_map = HashMap::new();
    for (name, value) in headers.iter() {
        let key = name.as_str().to_ascii_lowercase();
        if header_map.contains_key(&key) {
            continue; // first value wins
        }
        if let Ok(v) = value.to_str() {
            header_map.insert(key, v.to_string());
        }
    }

    let mut query = HashMap::new();
    if let Some(q) = uri.query() {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            query.entry(k.into_owned()).or_insert_with(|| v.into_owned());
        }
    }

    let raw_content_type = header_map.get("content-type").cloned().unwrap_or_default();
    let content_type = effective_content_type(&raw_content_type, hook);

    let json_part_names: Vec<String> = hook
        .map(|h| h.parse_parameters_as_json.iter().map(|p| p.name.clone()).collect())
        .unwrap_or_default();

    let (payload, parse_error) = decode_payload(&content_type, &body, &json_part_names, max_multipart_memory).await;

    let mut request = ParsedRequest {
        id,
        method,
        remote_addr,
        raw_request_uri: uri.to_string(),
        headers: header_map,
        query,
        payload,
        body,
        content_type,
        context: HashMap::new(),
    };

    if let Some(hook) = hook {
        apply_parse_parameters_as_json(&mut request, &hook.parse_parameters_as_json);
    }

    ParseOutcome { request, parse_error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_content_type() {
        assert_eq!(normalize_content_type("Application/JSON; charset=utf-8"), "application/json");
    }

    #[test]
    fn decodes_form_urlencoded_repeated_keys_as_list() {
        let (v, err) = decode_form(b"a=1&a=2&b=3");
        assert!(err.is_none());
        assert_eq!(v["a"], serde_json::json!(["1", "2"]));
        assert_eq!(v["b"], serde_json::json!("3"));
    }

    #[test]
    fn decodes_json_body() {
        let (v, err) = decode_json(br#"{"ref":"refs/heads/main"}"#);
        assert!(err.is_none());
        assert_eq!(v["ref"], "refs/heads/main");
    }

    #[test]
    fn malformed_json_yields_error_not_panic() {
        let (v, err) = decode_json(b"{not json");
        assert!(err.is_some());
        assert!(v.is_object());
    }
}
