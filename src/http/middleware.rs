//! C10 cross-cutting request handling: request-ID propagation, the global
//! token-bucket rate limiter, and the response header injector.

use crate::config::{RateLimitConfig, RequestIdConfig};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

type DirectRateLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Wraps a `governor` token bucket; `None` when rate limiting is disabled
/// so the hot path has no branch cost beyond an `Option::is_some` check.
pub struct RateLimiterMiddleware {
    limiter: Option<DirectRateLimiter>,
}

impl RateLimiterMiddleware {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        if !cfg.enabled {
            return RateLimiterMiddleware { limiter: None };
        }
        let rps = NonZeroU32::new(cfg.requests_per_second.max(1)).expect("checked max(1)");
        let burst = NonZeroU32::new(cfg.burst.max(1)).expect("checked max(1)");
        let quota = Quota::per_second(rps).allow_burst(burst);
        RateLimiterMiddleware { limiter: Some(RateLimiter::direct(quota)) }
    }

    /// `true` if the request may proceed; `false` ⇒ caller should respond
    /// 429 with a `Retry-After` header (spec §4.C10).
    pub fn check(&self) -> Result<(), u64> {
        let Some(limiter) = &self.limiter else { return Ok(()) };
        match limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(governor::clock::DefaultClock::default().now());
                Err(wait.as_secs().max(1))
            }
        }
    }
}

/// Resolves the request ID for a request: accepts a caller-supplied
/// `X-Request-Id` (truncated to the configured max length) if the feature
/// is enabled, otherwise mints a fresh UUIDv4 (spec §4.C10).
pub fn resolve_request_id(incoming: Option<&str>, cfg: &RequestIdConfig) -> String {
    if cfg.accept_incoming {
        if let Some(id) = incoming {
            if !id.is_empty() {
                let truncated: String = id.chars().take(cfg.max_length).collect();
                return truncated;
            }
        }
    }
    Uuid::new_v4().to_string()
}

/// Appends operator-configured response headers (spec §6: "Custom
/// `response-headers` are appended verbatim") without clobbering headers
/// the handler has already set.
pub fn inject_headers(builder: http::response::Builder, headers: &[(String, String)]) -> http::response::Builder {
    let mut builder = builder;
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
}

pub type SharedRateLimiter = Arc<RateLimiterMiddleware>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_a_uuid_when_incoming_not_accepted() {
        let cfg = RequestIdConfig { accept_incoming: false, max_length: 64 };
        let id = resolve_request_id(Some("client-supplied"), &cfg);
        assert_ne!(id, "client-supplied");
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn truncates_accepted_incoming_id() {
        let cfg = RequestIdConfig { accept_incoming: true, max_length: 4 };
        let id = resolve_request_id(Some("abcdefgh"), &cfg);
        assert_eq!(id, "abcd");
    }

    #[test]
    fn disabled_rate_limiter_always_passes() {
        let cfg = RateLimitConfig { enabled: false, requests_per_second: 1, burst: 1 };
        let mw = RateLimiterMiddleware::new(&cfg);
        for _ in 0..10 {
            assert!(mw.check().is_ok());
        }
    }

    #[test]
    fn enabled_rate_limiter_eventually_rejects_a_burst() {
        let cfg = RateLimitConfig { enabled: true, requests_per_second: 1, burst: 1 };
        let mw = RateLimiterMiddleware::new(&cfg);
        assert!(mw.check().is_ok());
        assert!(mw.check().is_err());
    }
}
