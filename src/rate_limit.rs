use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitPolicy {
    requests_per_second: f64,
    burst: usize,
    max_throttle_delay: Duration,
}

impl RateLimitPolicy {
    pub const fn standard() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
            max_throttle_delay: Duration::from_secs(30),
        }
    }

    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        self
    }

    pub const fn burst(mut self, burst: usize) -> Self {
        self.burst = burst;
        self
    }

    /// Upper bound applied to server-announced throttle windows.
    pub const fn max_throttle_delay(mut self, max_throttle_delay: Duration) -> Self {
        self.max_throttle_delay = max_throttle_delay;
        self
    }

    fn normalize(self) -> Self {
        Self {
            requests_per_second: if self.requests_per_second.is_finite()
                && self.requests_per_second > 0.0
            {
                self.requests_per_second
            } else {
                1.0
            },
            burst: self.burst.max(1),
            max_throttle_delay: self.max_throttle_delay,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
struct TokenBucket {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill_at: Instant,
    throttle_until: Option<Instant>,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        let policy = policy.normalize();
        Self {
            policy,
            tokens: policy.burst as f64,
            last_refill_at: now,
            throttle_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        let replenished = elapsed_secs * self.policy.requests_per_second;
        self.tokens = (self.tokens + replenished).min(self.policy.burst as f64);
        if let Some(throttle_until) = self.throttle_until
            && now >= throttle_until
        {
            self.throttle_until = None;
        }
    }

    fn wait_duration(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if let Some(throttle_until) = self.throttle_until
            && now < throttle_until
        {
            return throttle_until.saturating_duration_since(now);
        }
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        let needed_tokens = (1.0 - self.tokens).max(0.0);
        let delay_secs = needed_tokens / self.policy.requests_per_second;
        if delay_secs <= f64::EPSILON {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }

    fn can_consume_now(&mut self, now: Instant) -> bool {
        self.refill(now);
        if let Some(throttle_until) = self.throttle_until
            && now < throttle_until
        {
            return false;
        }
        self.tokens >= 1.0
    }

    fn consume_ready_token(&mut self) {
        debug_assert!(self.tokens >= 1.0);
        self.tokens = (self.tokens - 1.0).max(0.0);
    }

    fn apply_throttle(&mut self, now: Instant, delay: Duration) {
        let capped_delay = delay.min(self.policy.max_throttle_delay);
        if capped_delay.is_zero() {
            return;
        }
        let throttle_until = now + capped_delay;
        self.throttle_until = Some(match self.throttle_until {
            Some(existing) => existing.max(throttle_until),
            None => throttle_until,
        });
    }
}

/// Admission was abandoned because the caller cancelled; no token was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AdmissionCancelled;

/// Process-wide token bucket shared by every send on one `Sender`.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub(crate) fn new(policy: RateLimitPolicy) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(policy, Instant::now())),
        }
    }

    /// Takes a token when one is ready, otherwise reports how long to wait.
    pub(crate) fn acquire_delay(&self) -> Duration {
        let now = Instant::now();
        let mut bucket = lock_unpoisoned(&self.bucket);
        if bucket.can_consume_now(now) {
            bucket.consume_ready_token();
            return Duration::ZERO;
        }
        bucket.wait_duration(now)
    }

    /// Waits until a token is available or `cancel` fires. Returns the time
    /// spent waiting.
    pub(crate) async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Duration, AdmissionCancelled> {
        let mut waited = Duration::ZERO;
        loop {
            let delay = self.acquire_delay();
            if delay.is_zero() {
                return Ok(waited);
            }
            debug!(delay_ms = delay.as_millis() as u64, "waiting for rate limit token");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AdmissionCancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            waited += delay;
        }
    }

    /// Blocks new admissions for `delay`, capped by the policy's throttle ceiling.
    pub(crate) fn observe_server_throttle(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.apply_throttle(Instant::now(), delay);
    }
}
