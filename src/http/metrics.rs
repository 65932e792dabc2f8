//! Minimal Prometheus text-exposition metrics (spec §6: `GET /metrics`).
//!
//! Deliberately not a full third-party Prometheus client — the metric
//! *exposition engine*'s sophistication is an out-of-scope external
//! collaborator per spec §1. This registry just tracks the counters and
//! gauges spec §6 names, with lock-free atomic updates (spec §5).

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Gauge(AtomicI64);

impl Gauge {
    fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide metric set. One label set per hook / per HTTP
/// method-status-path triple, as spec §6 requires.
#[derive(Default)]
pub struct Metrics {
    http_requests_total: DashMap<(String, String, u16), Counter>,
    http_request_duration_micros_total: DashMap<(String, String, u16), AtomicU64>,
    hook_executions_total: DashMap<(String, String), Counter>,
    hook_concurrency: DashMap<String, Gauge>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, elapsed_micros: u64) {
        let key = (method.to_string(), path.to_string(), status);
        self.http_requests_total.entry(key.clone()).or_default().incr();
        self.http_request_duration_micros_total
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(elapsed_micros, Ordering::Relaxed);
    }

    pub fn record_hook_execution(&self, hook_id: &str, status: &str) {
        self.hook_executions_total.entry((hook_id.to_string(), status.to_string())).or_default().incr();
    }

    pub fn set_hook_concurrency(&self, hook_id: &str, value: i64) {
        self.hook_concurrency.entry(hook_id.to_string()).or_default().set(value);
    }

    /// Renders the whole registry as Prometheus text exposition (spec §6).
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP hookd_http_requests_total Total HTTP requests by method, path and status.\n");
        out.push_str("# TYPE hookd_http_requests_total counter\n");
        for entry in self.http_requests_total.iter() {
            let (method, path, status) = entry.key();
            out.push_str(&format!(
                "hookd_http_requests_total{{method=\"{method}\",path=\"{path}\",status=\"{status}\"}} {}\n",
                entry.value().get()
            ));
        }

        out.push_str("# HELP hookd_http_request_duration_microseconds_total Cumulative request latency by method, path and status.\n");
        out.push_str("# TYPE hookd_http_request_duration_microseconds_total counter\n");
        for entry in self.http_request_duration_micros_total.iter() {
            let (method, path, status) = entry.key();
            out.push_str(&format!(
                "hookd_http_request_duration_microseconds_total{{method=\"{method}\",path=\"{path}\",status=\"{status}\"}} {}\n",
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP hookd_hook_executions_total Hook executions by hook id and outcome.\n");
        out.push_str("# TYPE hookd_hook_executions_total counter\n");
        for entry in self.hook_executions_total.iter() {
            let (hook_id, status) = entry.key();
            out.push_str(&format!(
                "hookd_hook_executions_total{{hook_id=\"{hook_id}\",status=\"{status}\"}} {}\n",
                entry.value().get()
            ));
        }

        out.push_str("# HELP hookd_hook_concurrent_executions Current in-flight executions by hook id.\n");
        out.push_str("# TYPE hookd_hook_concurrent_executions gauge\n");
        for entry in self.hook_concurrency.iter() {
            out.push_str(&format!("hookd_hook_concurrent_executions{{hook_id=\"{}\"}} {}\n", entry.key(), entry.value().get()));
        }

        out.push_str("# HELP hookd_process_resident_memory_bytes Best-effort resident memory, read from /proc/self/statm.\n");
        out.push_str("# TYPE hookd_process_resident_memory_bytes gauge\n");
        out.push_str(&format!("hookd_process_resident_memory_bytes {}\n", resident_memory_bytes()));

        out
    }
}

/// Reads resident set size from /proc/self/statm. Returns 0 where that
/// file doesn't exist (e.g. non-Linux); this is a best-effort gauge, not
/// a hard requirement of the spec.
fn resident_memory_bytes() -> u64 {
    let page_size = 4096u64;
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(str::to_string))
        .and_then(|s| s.parse::<u64>().ok())
        .map(|pages| pages * page_size)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_counters() {
        let m = Metrics::new();
        m.record_http_request("GET", "/hooks/x", 200, 1500);
        m.record_hook_execution("x", "success");
        m.set_hook_concurrency("x", 2);
        let text = m.render();
        assert!(text.contains("hookd_http_requests_total{method=\"GET\",path=\"/hooks/x\",status=\"200\"} 1"));
        assert!(text.contains("hookd_hook_executions_total{hook_id=\"x\",status=\"success\"} 1"));
        assert!(text.contains("hookd_hook_concurrent_executions{hook_id=\"x\"} 2"));
    }
}
