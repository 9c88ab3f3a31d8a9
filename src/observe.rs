use std::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::resilience::BreakerState;

/// Where the wait before a retry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitSource {
    /// `Retry-After` header or the envelope's `retry_after` parameter.
    Server,
    /// Exponential backoff with jitter.
    Computed,
}

impl WaitSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Computed => "computed",
        }
    }
}

impl std::fmt::Display for WaitSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RetryEvent {
    pub method: String,
    /// Redacted request URI.
    pub uri: String,
    /// 1-based number of the attempt that is about to run.
    pub attempt: usize,
    pub max_attempts: usize,
    pub delay: Duration,
    pub wait_source: WaitSource,
    pub error_code: ErrorCode,
    pub api_error_code: Option<i64>,
}

/// Structured event sink for the send pipeline.
///
/// Every hook has a no-op default. Events never carry the bot token.
pub trait Observer: Send + Sync {
    fn on_breaker_transition(&self, _from: BreakerState, _to: BreakerState) {}

    fn on_retry_scheduled(&self, _event: &RetryEvent) {}

    fn on_send_succeeded(&self, _method: &str, _attempts: usize) {}

    fn on_send_failed(&self, _method: &str, _error: &Error) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
