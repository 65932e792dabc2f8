//! Crate-wide error kinds. Each corresponds to an entry in the error model:
//! ParameterNotFound is not an error type here (see `accessor::Accessed`),
//! everything else gets a typed variant so the dispatcher can map it to an
//! HTTP status without leaking internals into a response body.

use std::path::PathBuf;
use thiserror::Error;

/// Failures from compiling or decoding a hook document (C4).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: template error: {message}")]
    Template { path: PathBuf, message: String },
    #[error("{path}: hook #{index} ({id}): {message}")]
    Validation {
        path: PathBuf,
        index: usize,
        id: String,
        message: String,
    },
    #[error("{path}: duplicate hook id '{id}' within the same file")]
    DuplicateInFile { path: PathBuf, id: String },
}

/// HMAC / scalr-signature verification failure. Distinct from a generic
/// rule mismatch so the dispatcher can answer 403 rather than the
/// operator-configured mismatch code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no secrets configured for signature rule")]
    NoSecrets,
    #[error("signature header missing")]
    HeaderMissing,
    #[error("signature header malformed")]
    HeaderMalformed,
    #[error("signature mismatch")]
    Mismatch,
    #[error("stale or malformed timestamp")]
    StaleTimestamp,
}

/// Hard errors the rule evaluator can raise, as opposed to an ordinary
/// rule mismatch (which is just `false`).
#[derive(Debug, Error, Clone)]
pub enum RuleError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("trigger rule tree exceeds the maximum nesting depth")]
    TooDeep,
    #[error("invalid ip address or cidr range: {0}")]
    InvalidIp(String),
}

/// Command-assembly validation failures (C6).
#[derive(Debug, Error, Clone)]
pub enum CommandValidationError {
    #[error("command '{0}' is not under an allowed path")]
    PathNotWhitelisted(String),
    #[error("argument contains disallowed shell metacharacters")]
    UnsafeArgument,
    #[error("argument exceeds the configured max length ({0} > {1})")]
    ArgumentTooLong(usize, usize),
    #[error("total argument length exceeds the configured max ({0} > {1})")]
    TotalArgumentsTooLong(usize, usize),
    #[error("too many arguments ({0} > {1})")]
    TooManyArguments(usize, usize),
}

/// Errors surfaced by the registry on a failed replace.
#[derive(Debug, Error)]
#[error("hook id '{id}' already registered from {existing_path}")]
pub struct DuplicateIdError {
    pub id: String,
    pub existing_path: PathBuf,
}

/// Top-level dispatch error; the HTTP surface maps each variant to a
/// status code (spec §4.C7 / §7).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no hook registered at this path")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<String> },
    #[error("concurrency limit reached for this hook")]
    ConcurrencyLimit,
    #[error("trigger rule was not satisfied")]
    RuleMismatch { status: u16, message: String, headers: Vec<(String, String)> },
    #[error("request body too large")]
    BodyTooLarge,
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    CommandValidation(#[from] CommandValidationError),
    #[error("hook execution timed out")]
    Timeout,
    #[error("hook execution failed: {0}")]
    Execution(String),
    #[error("internal error: {0}")]
    Internal(String),
}
