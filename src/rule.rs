//! C3: compiles a raw `RuleDoc` into a `Rule` with pre-compiled regexes,
//! parsed CIDR ranges and resolved secrets, then recursively evaluates it
//! against a `ParsedRequest`.

use crate::accessor;
use crate::error::RuleError;
use crate::hook::{MatchKind, MatchSpec, ParamLocator, RuleDoc, SourceKind};
use crate::request::ParsedRequest;
use crate::signature::{self, HmacAlgo};
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

/// Guards against pathological configs recursing the evaluator into a
/// stack overflow (spec §4.C4 / §9: "removes any concern about stack
/// growth").
const MAX_RULE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub enum Rule {
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    Match(Match),
}

#[derive(Debug, Clone)]
pub enum Match {
    Value {
        parameter: ParamLocator,
        value: String,
    },
    Regex {
        parameter: ParamLocator,
        regex: Arc<Regex>,
    },
    Hmac {
        algo: HmacAlgo,
        parameter: ParamLocator,
        secrets: Arc<Vec<Vec<u8>>>,
    },
    IpWhitelist {
        parameter: ParamLocator,
        ranges: Arc<Vec<IpNet>>,
    },
    ScalrSignature {
        secret: Vec<u8>,
    },
}

impl Rule {
    pub fn compile(doc: &RuleDoc) -> Result<Rule, String> {
        compile_depth(doc, 0)
    }
}

fn compile_depth(doc: &RuleDoc, depth: usize) -> Result<Rule, String> {
    if depth > MAX_RULE_DEPTH {
        return Err("trigger rule tree exceeds the maximum nesting depth (64)".to_string());
    }
    Ok(match doc {
        RuleDoc::And { and } => {
            Rule::And(and.iter().map(|d| compile_depth(d, depth + 1)).collect::<Result<_, _>>()?)
        }
        RuleDoc::Or { or } => {
            Rule::Or(or.iter().map(|d| compile_depth(d, depth + 1)).collect::<Result<_, _>>()?)
        }
        RuleDoc::Not { not } => Rule::Not(Box::new(compile_depth(not, depth + 1)?)),
        RuleDoc::Match { match_ } => Rule::Match(compile_match(match_)?),
    })
}

fn compile_match(spec: &MatchSpec) -> Result<Match, String> {
    match spec.kind {
        MatchKind::Value => {
            let parameter = spec.parameter.clone().ok_or("value match requires a parameter")?;
            let value = spec.value.clone().ok_or("value match requires a value")?;
            Ok(Match::Value { parameter, value })
        }
        MatchKind::Regex => {
            let parameter = spec.parameter.clone().ok_or("regex match requires a parameter")?;
            let pattern = spec.regex.clone().ok_or("regex match requires a regex")?;
            let regex = Regex::new(&pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;
            Ok(Match::Regex { parameter, regex: Arc::new(regex) })
        }
        MatchKind::PayloadHmacSha1 => compile_hmac(spec, HmacAlgo::Sha1, false),
        MatchKind::PayloadHmacSha256 => compile_hmac(spec, HmacAlgo::Sha256, false),
        MatchKind::PayloadHmacSha512 => compile_hmac(spec, HmacAlgo::Sha512, false),
        MatchKind::LegacyPayloadHashSha1 => compile_hmac(spec, HmacAlgo::Sha1, true),
        MatchKind::LegacyPayloadHashSha256 => compile_hmac(spec, HmacAlgo::Sha256, true),
        MatchKind::LegacyPayloadHashSha512 => compile_hmac(spec, HmacAlgo::Sha512, true),
        MatchKind::IpWhitelist => {
            let parameter = spec.parameter.clone().unwrap_or(ParamLocator {
                source: SourceKind::Request,
                name: "remote-addr".to_string(),
            });
            let raw_ranges = spec.ip_range.clone().ok_or("ip-whitelist match requires ip-range")?;
            let ranges = raw_ranges.iter().map(|r| parse_ip_range(r)).collect::<Result<Vec<_>, _>>()?;
            Ok(Match::IpWhitelist { parameter, ranges: Arc::new(ranges) })
        }
        MatchKind::ScalrSignature => {
            let secret = spec.secret.clone().ok_or("scalr-signature match requires a secret")?;
            Ok(Match::ScalrSignature { secret: secret.into_bytes() })
        }
    }
}

fn compile_hmac(spec: &MatchSpec, algo: HmacAlgo, legacy: bool) -> Result<Match, String> {
    let parameter = spec.parameter.clone().ok_or("hmac match requires a parameter")?;
    let mut secrets: Vec<Vec<u8>> = Vec::new();
    if let Some(s) = &spec.secret {
        secrets.push(s.clone().into_bytes());
    }
    if let Some(list) = &spec.secrets {
        secrets.extend(list.iter().map(|s| s.clone().into_bytes()));
    }
    if secrets.is_empty() {
        return Err("hmac match requires a secret or secrets".to_string());
    }
    if legacy {
        // Open Question (spec §9): treat legacy payload-hash-* identically
        // to payload-hmac-*, flagged here rather than replicated as a bug.
        log::warn!("hook uses deprecated payload-hash-* match type, treating as payload-hmac-*");
    }
    Ok(Match::Hmac { algo, parameter, secrets: Arc::new(secrets) })
}

fn parse_ip_range(s: &str) -> Result<IpNet, String> {
    if let Ok(net) = IpNet::from_str(s) {
        return Ok(net);
    }
    let addr = IpAddr::from_str(s).map_err(|_| format!("invalid ip/cidr '{s}'"))?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).map_err(|_| format!("invalid ip/cidr '{s}'"))
}

/// Evaluates a compiled rule tree. `And` short-circuits on the first
/// failing (or erroring) child; `Or` short-circuits on the first passing
/// child, suppressing any error raised by an earlier sibling (spec's
/// pinned resolution of the Or/SignatureError Open Question).
pub fn evaluate(rule: &Rule, req: &ParsedRequest) -> Result<bool, RuleError> {
    match rule {
        Rule::And(children) => {
            for child in children {
                if !evaluate(child, req)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Rule::Or(children) => {
            let mut pending: Option<RuleError> = None;
            for child in children {
                match evaluate(child, req) {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) => pending = Some(strongest(pending, e)),
                }
            }
            match pending {
                Some(e) => Err(e),
                None => Ok(false),
            }
        }
        Rule::Not(child) => evaluate(child, req).map(|pass| !pass),
        Rule::Match(m) => evaluate_match(m, req),
    }
}

/// Signature errors outrank other rule errors when several siblings under
/// an `Or` fail for different reasons (spec §4.C3: "the strongest error
/// (signature > not-found) is reported").
fn strongest(existing: Option<RuleError>, new: RuleError) -> RuleError {
    match existing {
        Some(e @ RuleError::Signature(_)) => e,
        _ => new,
    }
}

fn evaluate_match(m: &Match, req: &ParsedRequest) -> Result<bool, RuleError> {
    match m {
        Match::Value { parameter, value } => {
            let resolved = accessor::resolve(req, parameter.source, &parameter.name);
            Ok(resolved.as_match_str().map(|s| s == *value).unwrap_or(false))
        }
        Match::Regex { parameter, regex } => {
            let resolved = accessor::resolve(req, parameter.source, &parameter.name);
            Ok(resolved.as_match_str().map(|s| regex.is_match(&s)).unwrap_or(false))
        }
        Match::Hmac { algo, parameter, secrets } => {
            let resolved = accessor::resolve(req, parameter.source, &parameter.name);
            let header_value = resolved.as_match_str();
            signature::verify_hmac(*algo, &req.body, header_value.as_deref(), secrets)
                .map(|_| true)
                .map_err(RuleError::from)
        }
        Match::IpWhitelist { parameter, ranges } => {
            let resolved = accessor::resolve(req, parameter.source, &parameter.name);
            let Some(addr_str) = resolved.as_match_str() else { return Ok(false) };
            let Ok(addr) = addr_str.parse::<IpAddr>() else { return Ok(false) };
            Ok(ranges.iter().any(|net| net.contains(&addr)))
        }
        Match::ScalrSignature { secret } => {
            let date = req.header("date");
            let sig = req.header("x-scalr-signature");
            signature::verify_scalr(
                secret,
                date,
                req.method.as_str(),
                &req.raw_request_uri,
                &req.body,
                sig,
                OffsetDateTime::now_utc(),
            )
            .map(|_| true)
            .map_err(RuleError::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::RuleDoc;
    use std::collections::HashMap;

    fn req_with_query(pairs: &[(&str, &str)]) -> ParsedRequest {
        ParsedRequest {
            id: "r".into(),
            method: http::Method::GET,
            remote_addr: "203.0.113.9".into(),
            raw_request_uri: "/hooks/h".into(),
            headers: HashMap::new(),
            query: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            payload: serde_json::Value::Null,
            body: Vec::new(),
            content_type: "".into(),
            context: HashMap::new(),
        }
    }

    fn parse_rule(json: &str) -> Rule {
        let doc: RuleDoc = serde_json::from_str(json).unwrap();
        Rule::compile(&doc).unwrap()
    }

    #[test]
    fn value_match_passes_and_fails() {
        let rule = parse_rule(r#"{"match":{"type":"value","parameter":{"source":"query","name":"token"},"value":"s3cret"}}"#);
        let ok = req_with_query(&[("token", "s3cret")]);
        assert!(evaluate(&rule, &ok).unwrap());
        let bad = req_with_query(&[("token", "x")]);
        assert!(!evaluate(&rule, &bad).unwrap());
    }

    #[test]
    fn and_short_circuits_on_first_failure() {
        let rule = parse_rule(
            r#"{"and":[
                {"match":{"type":"value","parameter":{"source":"query","name":"a"},"value":"1"}},
                {"match":{"type":"value","parameter":{"source":"query","name":"b"},"value":"2"}}
            ]}"#,
        );
        let req = req_with_query(&[("a", "0"), ("b", "2")]);
        assert!(!evaluate(&rule, &req).unwrap());
    }

    #[test]
    fn or_suppresses_signature_error_if_a_later_sibling_passes() {
        let rule = parse_rule(
            r#"{"or":[
                {"match":{"type":"payload-hmac-sha256","parameter":{"source":"header","name":"x-sig"},"secret":"s"}},
                {"match":{"type":"value","parameter":{"source":"query","name":"a"},"value":"1"}}
            ]}"#,
        );
        let req = req_with_query(&[("a", "1")]);
        assert!(evaluate(&rule, &req).unwrap());
    }

    #[test]
    fn ip_whitelist_matches_cidr() {
        let rule = parse_rule(r#"{"match":{"type":"ip-whitelist","ip-range":["203.0.113.0/24"]}}"#);
        let req = req_with_query(&[]);
        assert!(evaluate(&rule, &req).unwrap());
    }

    #[test]
    fn rejects_rule_tree_deeper_than_64() {
        let mut doc = RuleDoc::Match {
            match_: serde_json::from_str(r#"{"type":"value","parameter":{"source":"query","name":"a"},"value":"1"}"#).unwrap(),
        };
        for _ in 0..70 {
            doc = RuleDoc::Not { not: Box::new(doc) };
        }
        assert!(Rule::compile(&doc).is_err());
    }
}
