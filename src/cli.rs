//! The thin clap-derived surface that fills in a `ServerConfig` (spec §6's
//! CLI surface). Flag *parsing* is named an out-of-scope external
//! collaborator in spec §1; this is the minimum needed for the binary to
//! run, not a reimplementation of every flag's edge-case behavior.
//! `-setuid`/`-setgid`/`-pidfile`/`-lang`/`-lang-dir` are accepted so
//! scripts invoking the real tool don't fail to parse, but only log a
//! "not implemented" notice (privilege drop, the pid-file writer and the
//! i18n text lookup are separately listed out-of-scope collaborators).

use crate::config::{ListenerTimeouts, RateLimitConfig, RequestIdConfig, ServerConfig};
use crate::loader::DocumentMode;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "hookd: configurable HTTP-to-command webhook dispatch server",
    long_about = "hookd exposes each configured hook at /<urlprefix>/<hook-id>. \
                  An incoming request is parsed, the hook's trigger rule is \
                  evaluated against it, and on a match the hook's command is \
                  spawned with arguments and environment derived from the \
                  request."
)]
pub struct Cli {
    /// Hook document to load; may be given multiple times.
    #[arg(long = "hooks", value_name = "FILE", env = "HOOKD_HOOKS")]
    pub hooks: Vec<PathBuf>,

    #[arg(long = "ip", default_value = "0.0.0.0", env = "HOOKD_IP")]
    pub ip: IpAddr,

    #[arg(long = "port", default_value_t = 9000, env = "HOOKD_PORT")]
    pub port: u16,

    #[arg(long = "urlprefix", default_value = "hooks", env = "HOOKD_URLPREFIX")]
    pub urlprefix: String,

    #[arg(long = "verbose", env = "HOOKD_VERBOSE")]
    pub verbose: bool,

    #[arg(long = "debug", env = "HOOKD_DEBUG")]
    pub debug: bool,

    #[arg(long = "logfile", value_name = "FILE", env = "HOOKD_LOGFILE")]
    pub logfile: Option<PathBuf>,

    #[arg(long = "hotreload", env = "HOOKD_HOTRELOAD")]
    pub hotreload: bool,

    #[arg(long = "template", env = "HOOKD_TEMPLATE")]
    pub template: bool,

    /// Don't abort startup if no hooks could be loaded.
    #[arg(long = "nopanic", env = "HOOKD_NOPANIC")]
    pub nopanic: bool,

    /// Extra response header, `name=value`; may be given multiple times.
    #[arg(long = "header", value_name = "NAME=VALUE")]
    pub header: Vec<String>,

    #[arg(long = "http-methods", value_delimiter = ',', env = "HOOKD_HTTP_METHODS")]
    pub http_methods: Vec<String>,

    #[arg(long = "setuid", env = "HOOKD_SETUID")]
    pub setuid: Option<u32>,

    #[arg(long = "setgid", env = "HOOKD_SETGID")]
    pub setgid: Option<u32>,

    #[arg(long = "pidfile", value_name = "FILE", env = "HOOKD_PIDFILE")]
    pub pidfile: Option<PathBuf>,

    #[arg(long = "max-multipart-mem", default_value_t = 1024 * 1024, env = "HOOKD_MAX_MULTIPART_MEM")]
    pub max_multipart_mem: usize,

    #[arg(long = "max-request-body-size", default_value_t = 10 * 1024 * 1024, env = "HOOKD_MAX_REQUEST_BODY_SIZE")]
    pub max_request_body_size: usize,

    #[arg(long = "x-request-id", env = "HOOKD_X_REQUEST_ID")]
    pub x_request_id: bool,

    #[arg(long = "x-request-id-limit", default_value_t = 64, env = "HOOKD_X_REQUEST_ID_LIMIT")]
    pub x_request_id_limit: usize,

    #[arg(long = "allowed-command-paths", value_delimiter = ',', env = "HOOKD_ALLOWED_COMMAND_PATHS")]
    pub allowed_command_paths: Vec<PathBuf>,

    #[arg(long = "max-arg-length", default_value_t = 8192, env = "HOOKD_MAX_ARG_LENGTH")]
    pub max_arg_length: usize,

    #[arg(long = "max-total-args-length", default_value_t = 131072, env = "HOOKD_MAX_TOTAL_ARGS_LENGTH")]
    pub max_total_args_length: usize,

    #[arg(long = "max-args-count", default_value_t = 256, env = "HOOKD_MAX_ARGS_COUNT")]
    pub max_args_count: usize,

    #[arg(long = "strict-mode", env = "HOOKD_STRICT_MODE")]
    pub strict_mode: bool,

    #[arg(long = "rate-limit-enabled", env = "HOOKD_RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: bool,

    #[arg(long = "rate-limit-rps", default_value_t = 100, env = "HOOKD_RATE_LIMIT_RPS")]
    pub rate_limit_rps: u32,

    #[arg(long = "rate-limit-burst", default_value_t = 200, env = "HOOKD_RATE_LIMIT_BURST")]
    pub rate_limit_burst: u32,

    #[arg(long = "hook-timeout-seconds", default_value_t = 30, env = "HOOKD_HOOK_TIMEOUT_SECONDS")]
    pub hook_timeout_seconds: u64,

    #[arg(long = "hook-concurrency", default_value_t = 10, env = "HOOKD_HOOK_CONCURRENCY")]
    pub hook_concurrency: usize,

    #[arg(long = "read-timeout", default_value_t = 30, env = "HOOKD_READ_TIMEOUT")]
    pub read_timeout: u64,

    #[arg(long = "write-timeout", default_value_t = 30, env = "HOOKD_WRITE_TIMEOUT")]
    pub write_timeout: u64,

    #[arg(long = "idle-timeout", default_value_t = 120, env = "HOOKD_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    #[arg(long = "max-header-bytes", default_value_t = 1 << 20, env = "HOOKD_MAX_HEADER_BYTES")]
    pub max_header_bytes: usize,

    /// Load and validate the configured hooks, then exit (0 if valid).
    #[arg(long = "validate-config")]
    pub validate_config: bool,

    #[arg(long = "lang", env = "HOOKD_LANG")]
    pub lang: Option<String>,

    #[arg(long = "lang-dir", env = "HOOKD_LANG_DIR")]
    pub lang_dir: Option<PathBuf>,
}

impl Cli {
    /// Warns about flags this crate accepts for compatibility but whose
    /// implementation lives in an out-of-scope collaborator (spec §1).
    pub fn warn_unimplemented(&self) {
        if self.setuid.is_some() || self.setgid.is_some() {
            log::warn!("-setuid/-setgid requested but privilege-drop is an external collaborator; not implemented here");
        }
        if self.pidfile.is_some() {
            log::warn!("-pidfile requested but the pid-file writer is an external collaborator; not implemented here");
        }
        if self.lang.is_some() || self.lang_dir.is_some() {
            log::warn!("-lang/-lang-dir requested but message localization is an external collaborator; not implemented here");
        }
    }

    pub fn parse_headers(&self) -> Vec<(String, String)> {
        self.header
            .iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect()
    }

    pub fn into_server_config(self) -> ServerConfig {
        let document_mode = if self.template { DocumentMode::Template } else { DocumentMode::Literal };
        let extra_response_headers = self.parse_headers();
        ServerConfig {
            bind_addr: self.ip,
            port: self.port,
            url_prefix: self.urlprefix.clone(),
            hook_files: self.hooks.clone(),
            document_mode,
            hot_reload: self.hotreload,
            default_http_methods: self.http_methods.clone(),
            extra_response_headers,
            max_request_body_size: self.max_request_body_size,
            max_multipart_memory: self.max_multipart_mem,
            max_header_bytes: self.max_header_bytes,
            request_id: RequestIdConfig { accept_incoming: self.x_request_id, max_length: self.x_request_id_limit },
            rate_limit: RateLimitConfig {
                enabled: self.rate_limit_enabled,
                requests_per_second: self.rate_limit_rps,
                burst: self.rate_limit_burst,
            },
            command_policy: crate::command::CommandPolicy {
                allowed_path_prefixes: self.allowed_command_paths.clone(),
                strict_mode: self.strict_mode,
                max_argument_length: self.max_arg_length,
                max_total_argument_length: self.max_total_args_length,
                max_arguments: self.max_args_count,
            },
            hook_concurrency: self.hook_concurrency,
            hook_acquire_timeout: Duration::from_secs(5),
            hook_execution_timeout: Duration::from_secs(self.hook_timeout_seconds),
            listener_timeouts: ListenerTimeouts {
                read_header: Duration::from_secs(10),
                read: Duration::from_secs(self.read_timeout),
                write: Duration::from_secs(self.write_timeout),
                idle: Duration::from_secs(self.idle_timeout),
            },
            shutdown_grace: Duration::from_secs(30),
            pidfile: self.pidfile.clone(),
            setuid: self.setuid,
            setgid: self.setgid,
            nopanic: self.nopanic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_flag_pairs() {
        let cli = Cli::parse_from(["hookd", "--header", "X-A=1", "--header", "X-B=2"]);
        assert_eq!(cli.parse_headers(), vec![("X-A".to_string(), "1".to_string()), ("X-B".to_string(), "2".to_string())]);
    }

    #[test]
    fn template_flag_selects_document_mode() {
        let cli = Cli::parse_from(["hookd", "--template"]);
        let cfg = cli.into_server_config();
        assert!(matches!(cfg.document_mode, DocumentMode::Template));
    }
}
