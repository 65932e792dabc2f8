//! The hook document's wire shape (spec §3 / §6): what a JSON or YAML hook
//! file deserializes into, before validation and rule-tree compilation.
//! `loader` turns a `Vec<HookDoc>` into validated `hook::Hook`s with
//! compiled rule trees (see `rule::Rule::compile`).

use crate::rule::Rule;
use serde::Deserialize;
use std::path::PathBuf;

/// A `(source, name)` locator, shared by `Argument` and `MatchSpec`.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamLocator {
    pub source: SourceKind,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "header")]
    Header,
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "payload")]
    Payload,
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "rawrequest")]
    RawRequest,
    #[serde(rename = "string")]
    StringLiteral,
    #[serde(rename = "entire-payload")]
    EntirePayload,
    #[serde(rename = "entire-query")]
    EntireQuery,
    #[serde(rename = "entire-headers")]
    EntireHeaders,
    #[serde(rename = "context")]
    Context,
}

/// One entry of `pass-arguments-to-command` / `pass-environment-to-command`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Argument {
    pub source: SourceKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub envname: Option<String>,
    #[serde(default)]
    pub base64decode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MatchKind {
    #[serde(rename = "value")]
    Value,
    #[serde(rename = "regex")]
    Regex,
    #[serde(rename = "payload-hmac-sha1")]
    PayloadHmacSha1,
    #[serde(rename = "payload-hmac-sha256")]
    PayloadHmacSha256,
    #[serde(rename = "payload-hmac-sha512")]
    PayloadHmacSha512,
    #[serde(rename = "payload-hash-sha1")]
    LegacyPayloadHashSha1,
    #[serde(rename = "payload-hash-sha256")]
    LegacyPayloadHashSha256,
    #[serde(rename = "payload-hash-sha512")]
    LegacyPayloadHashSha512,
    #[serde(rename = "ip-whitelist")]
    IpWhitelist,
    #[serde(rename = "scalr-signature")]
    ScalrSignature,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MatchSpec {
    #[serde(rename = "type")]
    pub kind: MatchKind,
    #[serde(default)]
    pub parameter: Option<ParamLocator>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub secrets: Option<Vec<String>>,
    #[serde(default, rename = "ip-range", alias = "ipRange")]
    pub ip_range: Option<Vec<String>>,
}

/// Raw, uncompiled trigger-rule tree as it appears in the document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuleDoc {
    And {
        and: Vec<RuleDoc>,
    },
    Or {
        or: Vec<RuleDoc>,
    },
    Not {
        not: Box<RuleDoc>,
    },
    Match {
        #[serde(rename = "match")]
        match_: MatchSpec,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookDoc {
    pub id: String,
    pub execute_command: String,
    #[serde(default)]
    pub command_working_directory: Option<String>,
    #[serde(default)]
    pub response_message: String,
    #[serde(default)]
    pub response_headers: Vec<ResponseHeaderDoc>,
    #[serde(default = "default_success_code")]
    pub success_http_response_code: u16,
    #[serde(default)]
    pub http_methods: Vec<String>,
    #[serde(default)]
    pub include_command_output_in_response: bool,
    #[serde(default)]
    pub include_command_output_in_response_on_error: bool,
    #[serde(default)]
    pub parse_parameters_as_json: Vec<ParamLocator>,
    #[serde(default)]
    pub pass_arguments_to_command: Vec<Argument>,
    #[serde(default)]
    pub pass_environment_to_command: Vec<Argument>,
    #[serde(default)]
    pub trigger_rule: Option<RuleDoc>,
    #[serde(default = "default_mismatch_code")]
    pub trigger_rule_mismatch_http_response_code: u16,
    #[serde(default)]
    pub incoming_payload_content_type: Option<String>,
    #[serde(default)]
    pub stream_command_stdout_to_response: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseHeaderDoc {
    pub name: String,
    pub value: String,
}

fn default_success_code() -> u16 {
    200
}

fn default_mismatch_code() -> u16 {
    200
}

/// Top-level shape of a hook document: a bare array of hooks.
pub type HookDocList = Vec<HookDoc>;

/// A validated, compiled hook, as produced by `loader::compile_hook`. Same
/// field set as `HookDoc`, minus the fields consumed during compilation
/// (`trigger_rule` becomes a compiled `Rule` tree) plus the source file it
/// was loaded from, used by the registry to group/replace hooks per file.
#[derive(Debug, Clone)]
pub struct Hook {
    pub id: String,
    pub source_file: PathBuf,
    pub execute_command: String,
    pub command_working_directory: Option<String>,
    pub response_message: String,
    pub response_headers: Vec<ResponseHeaderDoc>,
    pub success_http_response_code: u16,
    pub http_methods: Vec<String>,
    pub include_command_output_in_response: bool,
    pub include_command_output_in_response_on_error: bool,
    pub parse_parameters_as_json: Vec<ParamLocator>,
    pub pass_arguments_to_command: Vec<Argument>,
    pub pass_environment_to_command: Vec<Argument>,
    pub trigger_rule: Option<Rule>,
    pub trigger_rule_mismatch_http_response_code: u16,
    pub incoming_payload_content_type: Option<String>,
    pub stream_command_stdout_to_response: bool,
}

impl Hook {
    /// Whether `method` is permitted for this hook. An empty `http-methods`
    /// list inherits `default_methods` (the `-http-methods` global); if that
    /// is also empty, any method is allowed (spec §3 default).
    pub fn allows_method(&self, method: &http::Method, default_methods: &[String]) -> bool {
        let effective = if self.http_methods.is_empty() { default_methods } else { &self.http_methods };
        if effective.is_empty() {
            return true;
        }
        effective.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }
}
