use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SenderMetricsSnapshot {
    pub sends_started: u64,
    pub sends_succeeded: u64,
    pub sends_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub server_delayed_retries: u64,
    pub circuit_rejections: u64,
    pub rate_limit_waits: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    /// Remote error codes seen on failed attempts, envelope or HTTP status.
    pub api_error_counts: BTreeMap<i64, u64>,
    /// Terminal failures keyed by `ErrorCode::as_str`.
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SenderMetrics {
    inner: Arc<SenderMetricsInner>,
}

#[derive(Debug, Default)]
struct SenderMetricsInner {
    sends_started: AtomicU64,
    sends_succeeded: AtomicU64,
    sends_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    server_delayed_retries: AtomicU64,
    circuit_rejections: AtomicU64,
    rate_limit_waits: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    api_error_counts: Mutex<BTreeMap<i64, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: SenderMetrics,
}

impl SenderMetrics {
    pub(crate) fn record_send_started(&self) -> InFlightGuard {
        self.inner.sends_started.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self, server_delayed: bool) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
        if server_delayed {
            self.inner
                .server_delayed_retries
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_circuit_rejection(&self) {
        self.inner.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limit_wait(&self) {
        self.inner.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt_error(&self, error: &Error) {
        if let Some(code) = error.api_error_code() {
            let mut api_error_counts = lock_unpoisoned(&self.inner.api_error_counts);
            *api_error_counts.entry(code).or_insert(0) += 1;
        }
    }

    pub(crate) fn record_send_completed<T>(&self, result: &Result<T, Error>, latency: Duration) {
        self.record_latency(latency);
        match result {
            Ok(_) => {
                self.inner.sends_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.inner.sends_failed.fetch_add(1, Ordering::Relaxed);
                let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
                *error_counts
                    .entry(error.code().as_str().to_owned())
                    .or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> SenderMetricsSnapshot {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        SenderMetricsSnapshot {
            sends_started: self.inner.sends_started.load(Ordering::Relaxed),
            sends_succeeded: self.inner.sends_succeeded.load(Ordering::Relaxed),
            sends_failed: self.inner.sends_failed.load(Ordering::Relaxed),
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            server_delayed_retries: self.inner.server_delayed_retries.load(Ordering::Relaxed),
            circuit_rejections: self.inner.circuit_rejections.load(Ordering::Relaxed),
            rate_limit_waits: self.inner.rate_limit_waits.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            api_error_counts: lock_unpoisoned(&self.inner.api_error_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
