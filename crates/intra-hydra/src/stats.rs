//! Engine statistics
//!
//! Monotonically non-decreasing counters shared by every worker. Values are
//! eventually consistent while work is in flight; they are only exact after
//! `join()`. Each update also feeds the `metrics` facade so an exporter can
//! be attached by the embedding program if it wants one.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

/// Shared request counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub caller_requests: AtomicU64,
    pub ok_requests: AtomicU64,
    pub non_ok_requests: AtomicU64,
    pub retries: AtomicU64,
    pub response_bytes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub caller_requests: u64,
    pub ok_requests: u64,
    pub non_ok_requests: u64,
    pub retries: u64,
    pub response_bytes: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request was accepted from the caller.
    pub fn record_submitted(&self) {
        self.caller_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hydra_caller_requests_total").increment(1);
    }

    /// A request completed with 200 and `bytes` of body.
    pub fn record_ok(&self, bytes: usize) {
        self.ok_requests.fetch_add(1, Ordering::Relaxed);
        self.response_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("hydra_requests_total", "outcome" => "ok").increment(1);
    }

    /// An attempt completed with a non-200 status.
    pub fn record_non_ok(&self, status: u16) {
        self.non_ok_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hydra_requests_total", "outcome" => "non_ok", "status" => status.to_string())
            .increment(1);
    }

    /// A failed attempt is about to be retried.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hydra_retries_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            caller_requests: self.caller_requests.load(Ordering::Relaxed),
            ok_requests: self.ok_requests.load(Ordering::Relaxed),
            non_ok_requests: self.non_ok_requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
        }
    }

    /// Emit the shutdown summary, at INFO when `stats` is set, else DEBUG.
    pub fn log_summary(&self, stats: bool) {
        let s = self.snapshot();
        for line in summary_lines(&s) {
            if stats {
                info!("{line}");
            } else {
                debug!("{line}");
            }
        }
    }
}

/// The statistics summary as printable lines.
pub fn summary_lines(s: &StatsSnapshot) -> Vec<String> {
    vec![
        "Statistics:".to_string(),
        format!("- {} requests", s.ok_requests + s.non_ok_requests),
        format!("---- {} automatic retries", s.retries),
        format!("---- {} successful (OK) requests", s.ok_requests),
        format!("---- {} unsuccessful requests", s.non_ok_requests),
        format!(
            "- {} ({:.2} MB) bytes received (only OK requests)",
            s.response_bytes,
            s.response_bytes as f64 / 1e6
        ),
    ]
}
