//! `ServerConfig`: the documented interface between flag/environment
//! parsing (an out-of-scope external collaborator per spec §1) and the
//! rest of the crate. `cli::Cli` is the thin clap-derived type that fills
//! one of these in; everything downstream (dispatcher, HTTP surface,
//! watcher) only ever sees a `ServerConfig`.

use crate::command::CommandPolicy;
use crate::loader::DocumentMode;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig { enabled: false, requests_per_second: 100, burst: 200 }
    }
}

#[derive(Debug, Clone)]
pub struct RequestIdConfig {
    pub accept_incoming: bool,
    pub max_length: usize,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        RequestIdConfig { accept_incoming: false, max_length: 64 }
    }
}

/// Listener-level timeouts (spec §5: "independently configurable").
#[derive(Debug, Clone)]
pub struct ListenerTimeouts {
    pub read_header: Duration,
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

impl Default for ListenerTimeouts {
    fn default() -> Self {
        ListenerTimeouts {
            read_header: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            idle: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub url_prefix: String,
    pub hook_files: Vec<PathBuf>,
    pub document_mode: DocumentMode,
    pub hot_reload: bool,
    pub default_http_methods: Vec<String>,
    pub extra_response_headers: Vec<(String, String)>,
    pub max_request_body_size: usize,
    pub max_multipart_memory: usize,
    pub max_header_bytes: usize,
    pub request_id: RequestIdConfig,
    pub rate_limit: RateLimitConfig,
    pub command_policy: CommandPolicy,
    pub hook_concurrency: usize,
    pub hook_acquire_timeout: Duration,
    pub hook_execution_timeout: Duration,
    pub listener_timeouts: ListenerTimeouts,
    pub shutdown_grace: Duration,
    pub pidfile: Option<PathBuf>,
    pub setuid: Option<u32>,
    pub setgid: Option<u32>,
    /// `-nopanic`: don't abort startup if no hooks could be loaded (spec
    /// §6 exit codes).
    pub nopanic: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 9000,
            url_prefix: "hooks".to_string(),
            hook_files: Vec::new(),
            document_mode: DocumentMode::Literal,
            hot_reload: false,
            default_http_methods: Vec::new(),
            extra_response_headers: Vec::new(),
            max_request_body_size: 10 * 1024 * 1024,
            max_multipart_memory: 1024 * 1024,
            max_header_bytes: 1 << 20,
            request_id: RequestIdConfig::default(),
            rate_limit: RateLimitConfig::default(),
            command_policy: CommandPolicy::default(),
            hook_concurrency: 10,
            hook_acquire_timeout: Duration::from_secs(5),
            hook_execution_timeout: Duration::from_secs(30),
            listener_timeouts: ListenerTimeouts::default(),
            shutdown_grace: Duration::from_secs(30),
            pidfile: None,
            setuid: None,
            setgid: None,
            nopanic: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_addr, self.port)
    }
}
