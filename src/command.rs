//! C6: turns a hook's `pass-arguments-to-command` / `pass-environment-to-command`
//! lists plus the resolved request into an argv/env ready to execute,
//! validating the result against the configured command-path whitelist and
//! (optionally) a strict shell-metacharacter scan.

use crate::accessor;
use crate::error::CommandValidationError;
use crate::hook::{Argument, Hook};
use crate::request::ParsedRequest;
use base64::Engine;
use std::path::{Path, PathBuf};

/// Shell metacharacters rejected in strict mode. Arguments reach the
/// target program as an argv array (never a shell), so this is a belt
/// and suspenders check against miscomposed downstream scripts.
const UNSAFE_CHARS: &[char] = &['`', '$', ';', '|', '&', '>', '<', '\n', '\r', '(', ')', '{', '}'];

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Command paths a hook's `execute-command` must live under. Empty
    /// means unrestricted (the operator opted out of the whitelist).
    pub allowed_path_prefixes: Vec<PathBuf>,
    pub strict_mode: bool,
    pub max_argument_length: usize,
    pub max_total_argument_length: usize,
    pub max_arguments: usize,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        CommandPolicy {
            allowed_path_prefixes: Vec::new(),
            strict_mode: false,
            max_argument_length: 8192,
            max_total_argument_length: 131072,
            max_arguments: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssembledCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

fn check_whitelist(program: &str, policy: &CommandPolicy) -> Result<(), CommandValidationError> {
    if policy.allowed_path_prefixes.is_empty() {
        return Ok(());
    }
    let path = Path::new(program);
    let allowed = policy.allowed_path_prefixes.iter().any(|prefix| path.starts_with(prefix));
    if allowed {
        Ok(())
    } else {
        Err(CommandValidationError::PathNotWhitelisted(program.to_string()))
    }
}

fn check_strict(value: &str, policy: &CommandPolicy) -> Result<(), CommandValidationError> {
    if policy.strict_mode && value.contains(UNSAFE_CHARS) {
        return Err(CommandValidationError::UnsafeArgument);
    }
    Ok(())
}

/// Resolves one locator to a command-ready string. Missing values become
/// an empty string (logged) rather than dropping the argument, so
/// positional argv indices stay stable across requests.
fn resolve_arg(req: &ParsedRequest, arg: &Argument) -> String {
    let resolved = accessor::resolve(req, arg.source, &arg.name);
    let mut value = match resolved.as_command_str() {
        Some(v) => v,
        None => {
            log::warn!("pass-arguments-to-command: parameter '{}' not found, using empty string", arg.name);
            String::new()
        }
    };
    if arg.base64decode {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&value) {
            value = String::from_utf8_lossy(&decoded).into_owned();
        }
    }
    value
}

/// Builds the argv/env/cwd for a hook invocation and validates the
/// result against `policy`. Argument and environment resolution never
/// hard-fails on a missing value (see `resolve_arg`); only the
/// whitelist/strict-mode/length checks below can reject the command.
pub fn build(hook: &Hook, req: &ParsedRequest, policy: &CommandPolicy) -> Result<AssembledCommand, CommandValidationError> {
    check_whitelist(&hook.execute_command, policy)?;

    let mut args = Vec::with_capacity(hook.pass_arguments_to_command.len());
    let mut total_len = 0usize;
    for arg in &hook.pass_arguments_to_command {
        let value = resolve_arg(req, arg);
        if value.len() > policy.max_argument_length {
            return Err(CommandValidationError::ArgumentTooLong(value.len(), policy.max_argument_length));
        }
        check_strict(&value, policy)?;
        total_len += value.len();
        args.push(value);
    }
    if args.len() > policy.max_arguments {
        return Err(CommandValidationError::TooManyArguments(args.len(), policy.max_arguments));
    }
    if total_len > policy.max_total_argument_length {
        return Err(CommandValidationError::TotalArgumentsTooLong(total_len, policy.max_total_argument_length));
    }

    let mut envs = Vec::with_capacity(hook.pass_environment_to_command.len());
    for arg in &hook.pass_environment_to_command {
        let value = resolve_arg(req, arg);
        check_strict(&value, policy)?;
        let name = arg.envname.clone().unwrap_or_else(|| arg.name.replace('.', "_").to_ascii_uppercase());
        envs.push((name, value));
    }

    Ok(AssembledCommand {
        program: hook.execute_command.clone(),
        args,
        envs,
        cwd: hook.command_working_directory.clone().map(PathBuf::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::SourceKind;
    use std::collections::HashMap;

    fn hook_with_args(args: Vec<Argument>) -> Hook {
        Hook {
            id: "h".into(),
            source_file: PathBuf::from("/dev/null"),
            execute_command: "/usr/bin/deploy".into(),
            command_working_directory: None,
            response_message: String::new(),
            response_headers: Vec::new(),
            success_http_response_code: 200,
            http_methods: Vec::new(),
            include_command_output_in_response: false,
            include_command_output_in_response_on_error: false,
            parse_parameters_as_json: Vec::new(),
            pass_arguments_to_command: args,
            pass_environment_to_command: Vec::new(),
            trigger_rule: None,
            trigger_rule_mismatch_http_response_code: 200,
            incoming_payload_content_type: None,
            stream_command_stdout_to_response: false,
        }
    }

    fn req() -> ParsedRequest {
        ParsedRequest {
            id: "r".into(),
            method: http::Method::POST,
            remote_addr: "127.0.0.1".into(),
            raw_request_uri: "/hooks/h".into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            payload: serde_json::json!({"ref": "refs/heads/main"}),
            body: Vec::new(),
            content_type: "application/json".into(),
            context: HashMap::new(),
        }
    }

    #[test]
    fn builds_argv_from_payload() {
        let hook = hook_with_args(vec![Argument {
            source: SourceKind::Payload,
            name: "ref".into(),
            envname: None,
            base64decode: false,
        }]);
        let cmd = build(&hook, &req(), &CommandPolicy::default()).unwrap();
        assert_eq!(cmd.args, vec!["refs/heads/main"]);
    }

    #[test]
    fn missing_argument_becomes_empty_string_not_an_error() {
        let hook = hook_with_args(vec![Argument {
            source: SourceKind::Payload,
            name: "nope".into(),
            envname: None,
            base64decode: false,
        }]);
        let cmd = build(&hook, &req(), &CommandPolicy::default()).unwrap();
        assert_eq!(cmd.args, vec![""]);
    }

    #[test]
    fn rejects_command_outside_whitelist() {
        let hook = hook_with_args(Vec::new());
        let policy = CommandPolicy { allowed_path_prefixes: vec![PathBuf::from("/opt/hooks")], ..Default::default() };
        let result = build(&hook, &req(), &policy);
        assert!(matches!(result, Err(CommandValidationError::PathNotWhitelisted(_))));
    }

    #[test]
    fn strict_mode_rejects_shell_metacharacters() {
        let hook = hook_with_args(vec![Argument {
            source: SourceKind::StringLiteral,
            name: "x; rm -rf /".into(),
            envname: None,
            base64decode: false,
        }]);
        let policy = CommandPolicy { strict_mode: true, ..Default::default() };
        let result = build(&hook, &req(), &policy);
        assert!(matches!(result, Err(CommandValidationError::UnsafeArgument)));
    }
}
