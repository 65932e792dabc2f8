//! C7: the per-request orchestration pipeline — hook lookup, method
//! filter, per-hook concurrency limiting, request parsing, rule
//! evaluation, command assembly and execution, response assembly.

use crate::command::{self, CommandPolicy};
use crate::error::DispatchError;
use crate::hook::Hook;
use crate::registry::Registry;
use crate::request::{self, ParsedRequest};
use crate::rule;
use crate::sanitize;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub command_policy: CommandPolicy,
    /// Max in-flight executions per hook id before a request is rejected
    /// with a concurrency-limit error rather than queued indefinitely.
    pub hook_concurrency: usize,
    /// How long a request will wait for a concurrency permit before
    /// giving up (spec §4.C7: "503 on timeout-acquire").
    pub acquire_timeout: Duration,
    pub execution_timeout: Duration,
    /// `-http-methods`: the global fallback a hook's empty `http-methods`
    /// list inherits (spec §3).
    pub default_http_methods: Vec<String>,
    /// `-max-multipart-mem`: per-field size cap for multipart bodies
    /// (spec §4.C5), passed through to `multer`'s constraints.
    pub max_multipart_memory: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            command_policy: CommandPolicy::default(),
            hook_concurrency: 10,
            acquire_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30),
            default_http_methods: Vec::new(),
            max_multipart_memory: 1024 * 1024,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    config: DispatcherConfig,
    semaphores: DashMap<String, Arc<Semaphore>>,
    pub metrics: Option<Arc<crate::http::metrics::Metrics>>,
}

pub struct DispatchOutcome {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub matched: bool,
}

/// A streaming dispatch: stdout is forwarded to the caller chunk-by-chunk
/// as the child produces it (spec §4.C7.9: "headers written on first
/// byte; trailers reflect exit status").
pub struct StreamingOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: mpsc::Receiver<Bytes>,
    pub exit_code: oneshot::Receiver<Option<i32>>,
}

/// Either shape a dispatched request can take, chosen by the hook's
/// `stream-command-stdout-to-response` flag.
pub enum DispatchResult {
    Buffered(DispatchOutcome),
    Streaming(StreamingOutcome),
}

struct CommandOutput {
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Shared state carried out of the common preamble (lookup, method
/// filter, concurrency gate, parse, rule evaluation, command assembly)
/// into either the buffered or the streaming execution path.
struct Prepared {
    hook: Arc<Hook>,
    assembled: command::AssembledCommand,
    permit: OwnedSemaphorePermit,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: DispatcherConfig) -> Self {
        Dispatcher { registry, config, semaphores: DashMap::new(), metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::http::metrics::Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn semaphore_for(&self, id: &str) -> Arc<Semaphore> {
        self.semaphores
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.hook_concurrency)))
            .clone()
    }

    async fn prepare(
        &self,
        id: &str,
        request_id: &str,
        method: http::Method,
        remote_addr: String,
        uri: &http::Uri,
        headers: &http::HeaderMap,
        body: Vec<u8>,
    ) -> Result<Prepared, DispatchError> {
        let hook = self.registry.match_by_id(id).ok_or(DispatchError::NotFound)?;

        if !hook.allows_method(&method, &self.config.default_http_methods) {
            return Err(DispatchError::MethodNotAllowed { allowed: hook.http_methods.clone() });
        }

        let semaphore = self.semaphore_for(id);
        let wait_start = Instant::now();
        let permit = tokio::time::timeout(self.config.acquire_timeout, semaphore.clone().acquire_owned())
            .await
            .map_err(|_| DispatchError::ConcurrencyLimit)?
            .map_err(|_| DispatchError::Internal("semaphore closed".to_string()))?;
        let wait = wait_start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.set_hook_concurrency(&hook.id, (self.config.hook_concurrency - semaphore.available_permits()) as i64);
        }

        let outcome =
            request::parse(request_id.to_string(), method, remote_addr, uri, headers, body, Some(&hook), self.config.max_multipart_memory).await;
        let mut req = outcome.request;
        if let Some(err) = &outcome.parse_error {
            log::warn!("request {request_id}: payload decode error: {err}");
        }
        req.context.insert("hook-id".to_string(), hook.id.clone());
        req.context.insert("concurrency-wait-ms".to_string(), wait.as_millis().to_string());

        let matched = match &hook.trigger_rule {
            None => true,
            Some(rule) => match rule::evaluate(rule, &req) {
                Ok(pass) => pass,
                Err(crate::error::RuleError::Signature(e)) => return Err(DispatchError::Signature(e)),
                Err(e) => return Err(DispatchError::Rule(e)),
            },
        };
        if !matched {
            return Err(DispatchError::RuleMismatch {
                status: hook.trigger_rule_mismatch_http_response_code,
                message: hook.response_message.clone(),
                headers: response_headers(&hook),
            });
        }

        let assembled = command::build(&hook, &req, &self.config.command_policy)?;
        log::info!(
            "request {request_id}: executing hook '{}': {} {:?}",
            hook.id,
            assembled.program,
            sanitize::redact_argv(&assembled.args),
        );

        Ok(Prepared { hook, assembled, permit })
    }

    /// Runs the full pipeline for one incoming request against hook `id`,
    /// dispatching to the buffered or streaming execution path per the
    /// hook's `stream-command-stdout-to-response` setting.
    pub async fn dispatch(
        &self,
        id: &str,
        request_id: String,
        method: http::Method,
        remote_addr: String,
        uri: &http::Uri,
        headers: &http::HeaderMap,
        body: Vec<u8>,
    ) -> Result<DispatchResult, DispatchError> {
        let prepared = match self.prepare(id, &request_id, method, remote_addr, uri, headers, body).await {
            Ok(p) => p,
            Err(DispatchError::RuleMismatch { status, message, headers }) => {
                return Ok(DispatchResult::Buffered(DispatchOutcome {
                    status,
                    body: message.into_bytes(),
                    headers,
                    matched: false,
                }));
            }
            Err(e) => return Err(e),
        };

        if prepared.hook.stream_command_stdout_to_response {
            Ok(DispatchResult::Streaming(self.run_streaming(prepared, &request_id)))
        } else {
            let outcome = self.run_buffered(prepared, &request_id).await;
            outcome.map(DispatchResult::Buffered)
        }
    }

    async fn run_buffered(&self, prepared: Prepared, request_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let Prepared { hook, assembled, permit } = prepared;
        let result = run_command(&assembled, self.config.execution_timeout).await;
        drop(permit);
        match result {
            Ok(output) => {
                if let Some(metrics) = &self.metrics {
                    let status = if output.exit_code == Some(0) { "success" } else { "error" };
                    metrics.record_hook_execution(&hook.id, status);
                }
                Ok(self.ok_outcome(&hook, &output))
            }
            Err(DispatchError::Timeout) => {
                log::warn!("request {request_id}: hook '{}' timed out", hook.id);
                if let Some(metrics) = &self.metrics {
                    metrics.record_hook_execution(&hook.id, "timeout");
                }
                Err(DispatchError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn run_streaming(&self, prepared: Prepared, request_id: &str) -> StreamingOutcome {
        let Prepared { hook, assembled, permit } = prepared;
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();
        let timeout = self.config.execution_timeout;
        let request_id = request_id.to_string();
        let metrics = self.metrics.clone();
        let hook_id = hook.id.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let exit = stream_command(&assembled, timeout, tx).await;
            if let Some(metrics) = &metrics {
                let status = match exit {
                    Some(0) => "success",
                    Some(_) => "error",
                    None => "timeout",
                };
                metrics.record_hook_execution(&hook_id, status);
            }
            if exit.is_none() {
                log::warn!("request {request_id}: hook '{hook_id}' timed out while streaming");
            }
            let _ = exit_tx.send(exit);
        });

        StreamingOutcome {
            status: hook.success_http_response_code,
            headers: response_headers(&hook),
            chunks: rx,
            exit_code: exit_rx,
        }
    }

    fn ok_outcome(&self, hook: &Hook, output: &CommandOutput) -> DispatchOutcome {
        let succeeded = output.exit_code == Some(0);
        let include_output = if succeeded {
            hook.include_command_output_in_response
        } else {
            hook.include_command_output_in_response_on_error
        };

        let body = if include_output {
            let mut b = output.stdout.clone();
            if !succeeded {
                b.extend_from_slice(b"\n");
                b.extend_from_slice(&output.stderr);
            }
            b
        } else {
            hook.response_message.clone().into_bytes()
        };

        let status = if succeeded { hook.success_http_response_code } else { 500 };
        DispatchOutcome { status, body, headers: response_headers(hook), matched: true }
    }
}

fn response_headers(hook: &Hook) -> Vec<(String, String)> {
    hook.response_headers.iter().map(|h| (h.name.clone(), h.value.clone())).collect()
}

/// Spawns `cmd` and waits up to `timeout`, draining stdout/stderr
/// concurrently with the wait to avoid a full pipe buffer deadlocking
/// the child. On timeout the child is force-killed; the in-flight
/// output read is abandoned along with it.
async fn run_command(cmd: &command::AssembledCommand, timeout: Duration) -> Result<CommandOutput, DispatchError> {
    let mut command = build_tokio_command(cmd);
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| DispatchError::Execution(e.to_string()))?;
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let drained = tokio::time::timeout(timeout, async {
        let read_out = async {
            let mut buf = Vec::new();
            let _: io::Result<usize> = stdout.read_to_end(&mut buf).await;
            buf
        };
        let read_err = async {
            let mut buf = Vec::new();
            let _: io::Result<usize> = stderr.read_to_end(&mut buf).await;
            buf
        };
        let (out, err) = tokio::join!(read_out, read_err);
        let status = child.wait().await;
        (status, out, err)
    })
    .await;

    match drained {
        Ok((status, stdout, stderr)) => {
            let status = status.map_err(|e| DispatchError::Execution(e.to_string()))?;
            Ok(CommandOutput { exit_code: status.code(), stdout, stderr })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(DispatchError::Timeout)
        }
    }
}

/// Streaming counterpart of `run_command`: forwards stdout chunks to
/// `tx` as they are read instead of buffering the whole output. stderr
/// is drained to the log only. Returns `None` on timeout (child killed),
/// `Some(code)` otherwise.
async fn stream_command(cmd: &command::AssembledCommand, timeout: Duration, tx: mpsc::Sender<Bytes>) -> Option<i32> {
    let mut command = build_tokio_command(cmd);
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to spawn streaming command: {e}");
            return Some(-1);
        }
    };
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let pump = async {
        let mut reader = BufReader::new(stdout);
        let mut buf = [0u8; 8192];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                break;
            }
        }
    };
    let drain_stderr = async {
        let mut buf = Vec::new();
        let _: io::Result<usize> = stderr.read_to_end(&mut buf).await;
        buf
    };

    let result = tokio::time::timeout(timeout, async {
        let (_, stderr_bytes) = tokio::join!(pump, drain_stderr);
        let status = child.wait().await;
        (status, stderr_bytes)
    })
    .await;

    match result {
        Ok((status, stderr_bytes)) => {
            if !stderr_bytes.is_empty() {
                log::debug!("stderr: {}", String::from_utf8_lossy(&stderr_bytes));
            }
            status.ok().and_then(|s| s.code())
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    }
}

fn build_tokio_command(cmd: &command::AssembledCommand) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(&cmd.program);
    command.args(&cmd.args);
    command.envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(cwd) = &cmd.cwd {
        command.current_dir(cwd);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Hook;
    use std::path::PathBuf;

    fn hook(id: &str, execute_command: &str, args: Vec<&str>) -> Hook {
        use crate::hook::{Argument, SourceKind};
        let pass_arguments_to_command = args
            .iter()
            .map(|a| Argument { source: SourceKind::StringLiteral, name: a.to_string(), envname: None, base64decode: false })
            .collect();
        Hook {
            id: id.to_string(),
            source_file: PathBuf::new(),
            execute_command: execute_command.to_string(),
            command_working_directory: None,
            response_message: "ok".to_string(),
            response_headers: Vec::new(),
            success_http_response_code: 200,
            http_methods: Vec::new(),
            include_command_output_in_response: true,
            include_command_output_in_response_on_error: false,
            parse_parameters_as_json: Vec::new(),
            pass_arguments_to_command,
            pass_environment_to_command: Vec::new(),
            trigger_rule: None,
            trigger_rule_mismatch_http_response_code: 200,
            incoming_payload_content_type: None,
            stream_command_stdout_to_response: false,
        }
    }

    fn registry_with(hook: Hook) -> Arc<Registry> {
        let reg = Registry::new();
        reg.replace_file(&PathBuf::from("/mem"), vec![hook]).unwrap();
        Arc::new(reg)
    }

    fn req_parts() -> (http::Method, String, http::Uri, http::HeaderMap) {
        (http::Method::POST, "127.0.0.1".to_string(), "/hooks/h".parse().unwrap(), http::HeaderMap::new())
    }

    #[tokio::test]
    async fn dispatch_404s_for_unknown_hook() {
        let reg = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(reg, DispatcherConfig::default());
        let (method, addr, uri, headers) = req_parts();
        let result = dispatcher.dispatch("nope", "r1".into(), method, addr, &uri, &headers, Vec::new()).await;
        assert!(matches!(result, Err(DispatchError::NotFound)));
    }

    #[tokio::test]
    async fn dispatch_runs_command_and_reports_success() {
        let reg = registry_with(hook("echo", "/bin/echo", vec!["hi"]));
        let dispatcher = Dispatcher::new(reg, DispatcherConfig::default());
        let (method, addr, uri, headers) = req_parts();
        let result = dispatcher.dispatch("echo", "r1".into(), method, addr, &uri, &headers, Vec::new()).await.unwrap();
        match result {
            DispatchResult::Buffered(outcome) => {
                assert_eq!(outcome.status, 200);
                assert!(outcome.matched);
            }
            DispatchResult::Streaming(_) => panic!("expected a buffered outcome"),
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_disallowed_method() {
        let mut h = hook("echo", "/bin/echo", Vec::new());
        h.http_methods = vec!["GET".to_string()];
        let reg = registry_with(h);
        let dispatcher = Dispatcher::new(reg, DispatcherConfig::default());
        let (method, addr, uri, headers) = req_parts();
        let result = dispatcher.dispatch("echo", "r1".into(), method, addr, &uri, &headers, Vec::new()).await;
        assert!(matches!(result, Err(DispatchError::MethodNotAllowed { .. })));
    }

    #[tokio::test]
    async fn dispatch_streams_stdout_for_streaming_hooks() {
        let mut h = hook("echo", "/bin/echo", vec!["streamed"]);
        h.stream_command_stdout_to_response = true;
        let reg = registry_with(h);
        let dispatcher = Dispatcher::new(reg, DispatcherConfig::default());
        let (method, addr, uri, headers) = req_parts();
        let result = dispatcher.dispatch("echo", "r1".into(), method, addr, &uri, &headers, Vec::new()).await.unwrap();
        match result {
            DispatchResult::Streaming(mut outcome) => {
                let mut collected = Vec::new();
                while let Some(chunk) = outcome.chunks.recv().await {
                    collected.extend_from_slice(&chunk);
                }
                assert_eq!(collected, b"streamed\n");
                assert_eq!(outcome.exit_code.await.unwrap(), Some(0));
            }
            DispatchResult::Buffered(_) => panic!("expected a streaming outcome"),
        }
    }

    #[tokio::test]
    async fn dispatch_maps_hmac_mismatch_to_signature_error_not_internal() {
        use crate::hook::{ParamLocator, SourceKind};
        use crate::rule::{Match, Rule};
        use crate::signature::HmacAlgo;
        use std::sync::Arc as StdArc;

        let mut h = hook("signed", "/bin/echo", vec!["ok"]);
        h.trigger_rule = Some(Rule::Match(Match::Hmac {
            algo: HmacAlgo::Sha256,
            parameter: ParamLocator { source: SourceKind::Header, name: "x-sig".to_string() },
            secrets: StdArc::new(vec![b"top".to_vec()]),
        }));
        let reg = registry_with(h);
        let dispatcher = Dispatcher::new(reg, DispatcherConfig::default());
        let (method, addr, uri, _) = req_parts();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-sig", "sha256=deadbeef".parse().unwrap());
        let result = dispatcher.dispatch("signed", "r1".into(), method, addr, &uri, &headers, Vec::new()).await;
        assert!(
            matches!(result, Err(DispatchError::Signature(_))),
            "hmac mismatch must map to DispatchError::Signature (403), got {result:?}"
        );
    }
}
