//! C10: routes `<method> /<prefix>/<hook-id>` to the dispatcher, plus the
//! always-mounted `/health` and `/metrics` endpoints. Owns body-size
//! capping, request-ID resolution, rate limiting and the header injector
//! — everything spec §4.C7/§4.C10 calls for ahead of C7's own pipeline.

use super::middleware;
use super::AppState;
use crate::error::DispatchError;
use crate::logging;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub type ResBody = BoxBody<Bytes, std::io::Error>;

fn text_body(s: impl Into<Bytes>) -> ResBody {
    Full::new(s.into()).map_err(|never: Infallible| match never {}).boxed()
}

fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(text_body(body))
        .expect("static response is well-formed")
}

/// Top-level hyper service entry point for one request on one connection.
pub async fn handle(req: Request<Incoming>, state: Arc<AppState>, remote_addr: SocketAddr) -> Result<Response<ResBody>, Infallible> {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let mut log_ctx = logging::log_context(remote_addr, String::new());
    log_ctx.start().request(req.method(), req.uri(), req.version());

    let response = route(req, &state, remote_addr, &mut log_ctx).await;

    let elapsed = start.elapsed();
    log_ctx.end().response(response.status(), None);
    log_ctx.emit();
    state.metrics.record_http_request(&method, &path, response.status().as_u16(), elapsed.as_micros() as u64);

    Ok(response)
}

async fn route(req: Request<Incoming>, state: &Arc<AppState>, remote_addr: SocketAddr, log_ctx: &mut logging::LoggingCtx) -> Response<ResBody> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    if path == "/health" {
        return plain_health();
    }
    if path == "/metrics" {
        return plain_response(StatusCode::OK, state.metrics.render());
    }

    if let Err(retry_after) = state.rate_limiter.check() {
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("retry-after", retry_after.to_string())
            .body(text_body("rate limit exceeded"))
            .expect("static response is well-formed");
    }

    let Some(hook_id) = hook_id_from_path(&path, &state.config.url_prefix) else {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    };

    let incoming_request_id = req.headers().get("x-request-id").and_then(|v| v.to_str().ok());
    let request_id = middleware::resolve_request_id(incoming_request_id, &state.config.request_id);
    *log_ctx = logging::log_context(remote_addr, request_id.clone());
    log_ctx.start().request(&method, &uri, req.version());

    let headers = req.headers().clone();
    let (parts, body) = req.into_parts();
    let limited = Limited::new(body, state.config.max_request_body_size);
    let body_bytes = match limited.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                return response_with_request_id(plain_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"), &request_id);
            }
            log::warn!("request {request_id}: failed to read body: {e}");
            return response_with_request_id(plain_response(StatusCode::BAD_REQUEST, "failed to read request body"), &request_id);
        }
    };

    let result = state
        .dispatcher
        .dispatch(&hook_id, request_id.clone(), method, remote_addr.ip().to_string(), &parts.uri, &headers, body_bytes)
        .await;

    let response = match result {
        Ok(crate::dispatcher::DispatchResult::Buffered(outcome)) => {
            let mut builder = Response::builder().status(outcome.status);
            builder = middleware::inject_headers(builder, &outcome.headers);
            builder = middleware::inject_headers(builder, &state.config.extra_response_headers);
            builder.body(text_body(outcome.body)).expect("dispatcher response is well-formed")
        }
        Ok(crate::dispatcher::DispatchResult::Streaming(outcome)) => {
            let mut builder = Response::builder().status(outcome.status);
            builder = middleware::inject_headers(builder, &outcome.headers);
            builder = middleware::inject_headers(builder, &state.config.extra_response_headers);
            let stream = ReceiverStream::new(outcome.chunks).map(|chunk| Ok::<_, std::io::Error>(Frame::data(chunk)));
            let body = StreamBody::new(stream).boxed();
            tokio::spawn(async move {
                let _ = outcome.exit_code.await;
            });
            builder.body(body).expect("dispatcher response is well-formed")
        }
        Err(e) => error_response(&e),
    };

    response_with_request_id(response, &request_id)
}

fn response_with_request_id(response: Response<ResBody>, request_id: &str) -> Response<ResBody> {
    let (mut parts, body) = response.into_parts();
    if let Ok(value) = http::HeaderValue::from_str(request_id) {
        parts.headers.insert("x-request-id", value);
    }
    Response::from_parts(parts, body)
}

fn plain_health() -> Response<ResBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(text_body(r#"{"status":"ok"}"#))
        .expect("static response is well-formed")
}

/// Maps a dispatch error to an HTTP status (spec §4.C7 step 5-9 / §7).
/// Rule evaluator and command-validation errors never leak their text
/// into the body — only a generic message plus the request ID.
fn error_response(err: &DispatchError) -> Response<ResBody> {
    match err {
        DispatchError::NotFound => plain_response(StatusCode::NOT_FOUND, "no hook registered at this path"),
        DispatchError::MethodNotAllowed { allowed } => Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header("allow", allowed.join(", "))
            .body(text_body("method not allowed"))
            .expect("static response is well-formed"),
        DispatchError::ConcurrencyLimit => plain_response(StatusCode::SERVICE_UNAVAILABLE, "hook is at its concurrency limit"),
        DispatchError::BodyTooLarge => plain_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
        DispatchError::Signature(_) => plain_response(StatusCode::FORBIDDEN, "forbidden"),
        DispatchError::Rule(e) => {
            log::error!("rule evaluation error: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        DispatchError::CommandValidation(e) => {
            log::error!("command validation error: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        DispatchError::Timeout => plain_response(StatusCode::GATEWAY_TIMEOUT, "hook execution timed out"),
        DispatchError::Execution(e) => {
            log::error!("hook execution failed: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        DispatchError::Internal(e) => {
            log::error!("internal error: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        DispatchError::RuleMismatch { status, message, headers } => {
            let mut builder = Response::builder().status(*status);
            builder = middleware::inject_headers(builder, headers);
            builder.body(text_body(message.clone())).expect("rule-mismatch response is well-formed")
        }
    }
}

/// `/<prefix>/<hook-id>` — exactly two path segments, the first matching
/// the configured url prefix (spec §6).
fn hook_id_from_path(path: &str, prefix: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    let first = segments.next()?;
    if first != prefix {
        return None;
    }
    let id = segments.next()?;
    if id.is_empty() || segments.next().is_some() {
        return None;
    }
    Some(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hook_id_from_prefixed_path() {
        assert_eq!(hook_id_from_path("/hooks/deploy", "hooks"), Some("deploy".to_string()));
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert_eq!(hook_id_from_path("/other/deploy", "hooks"), None);
    }

    #[test]
    fn rejects_extra_segments() {
        assert_eq!(hook_id_from_path("/hooks/deploy/extra", "hooks"), None);
    }
}
