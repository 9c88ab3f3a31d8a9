use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::info;

use crate::observe::{NoopObserver, Observer};
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half-open",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Request outcomes observed in the current breaker generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl BreakerCounts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        f64::from(self.total_failures) / f64::from(self.requests)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircuitBreakerPolicy {
    max_requests: u32,
    min_requests: u32,
    failure_ratio: f64,
    interval: Duration,
    open_timeout: Duration,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            max_requests: 5,
            min_requests: 5,
            failure_ratio: 0.5,
            interval: Duration::from_secs(120),
            open_timeout: Duration::from_secs(60),
        }
    }

    /// Probe requests admitted while half-open; the same number of consecutive
    /// probe successes closes the breaker.
    pub const fn max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// The breaker only trips once strictly more requests than this were seen.
    pub const fn min_requests(mut self, min_requests: u32) -> Self {
        self.min_requests = min_requests;
        self
    }

    pub fn failure_ratio(mut self, failure_ratio: f64) -> Self {
        self.failure_ratio = if failure_ratio.is_finite() {
            failure_ratio.clamp(f64::EPSILON, 1.0)
        } else {
            0.5
        };
        self
    }

    /// Length of the closed-state counting window. Zero never resets the counts.
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub const fn open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    fn ready_to_trip(&self, counts: &BreakerCounts) -> bool {
        counts.requests > self.min_requests && counts.failure_ratio() >= self.failure_ratio
    }

    fn configured_max_requests(&self) -> u32 {
        self.max_requests.max(1)
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// The breaker refused an attempt; no network call was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitRejection {
    pub state: BreakerState,
    pub retry_after: Duration,
}

#[derive(Clone, Copy, Debug)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    generation: u64,
    counts: BreakerCounts,
    expiry: Option<Instant>,
}

impl BreakerInner {
    fn remaining_open(&self, now: Instant) -> Duration {
        match self.expiry {
            Some(expiry) => expiry.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    inner: Mutex<BreakerInner>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitBreaker")
            .field("policy", &self.policy)
            .field("inner", &*lock_unpoisoned(&self.inner))
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self::with_observer(policy, Arc::new(NoopObserver))
    }

    pub fn with_observer(policy: CircuitBreakerPolicy, observer: Arc<dyn Observer>) -> Self {
        let now = Instant::now();
        let mut inner = BreakerInner {
            state: BreakerState::Closed,
            generation: 0,
            counts: BreakerCounts::default(),
            expiry: None,
        };
        start_generation(&policy, &mut inner, now);
        Self {
            policy,
            inner: Mutex::new(inner),
            observer,
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = lock_unpoisoned(&self.inner);
            self.refresh(&mut inner, Instant::now(), &mut transitions);
            inner.state
        };
        self.emit(&transitions);
        state
    }

    pub fn counts(&self) -> BreakerCounts {
        let mut transitions = Vec::new();
        let counts = {
            let mut inner = lock_unpoisoned(&self.inner);
            self.refresh(&mut inner, Instant::now(), &mut transitions);
            inner.counts
        };
        self.emit(&transitions);
        counts
    }

    /// Admits one attempt or rejects it without touching the network.
    ///
    /// The returned guard must be resolved with [`CircuitAttempt::mark_success`]
    /// or [`CircuitAttempt::mark_failure`]; dropping it counts as a failure.
    pub fn begin(self: &Arc<Self>) -> Result<CircuitAttempt, CircuitRejection> {
        let mut transitions = Vec::new();
        let admitted = {
            let mut inner = lock_unpoisoned(&self.inner);
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut transitions);
            match inner.state {
                BreakerState::Open => Err(CircuitRejection {
                    state: BreakerState::Open,
                    retry_after: inner.remaining_open(now),
                }),
                BreakerState::HalfOpen
                    if inner.counts.requests >= self.policy.configured_max_requests() =>
                {
                    Err(CircuitRejection {
                        state: BreakerState::HalfOpen,
                        retry_after: Duration::ZERO,
                    })
                }
                BreakerState::Closed | BreakerState::HalfOpen => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            }
        };
        self.emit(&transitions);

        admitted.map(|generation| CircuitAttempt {
            breaker: Arc::clone(self),
            generation,
            completed: false,
        })
    }

    fn record(&self, generation: u64, success: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = lock_unpoisoned(&self.inner);
            let now = Instant::now();
            self.refresh(&mut inner, now, &mut transitions);
            // Outcomes from an earlier generation belong to counts that were reset.
            if inner.generation == generation {
                if success {
                    self.on_success(&mut inner, now, &mut transitions);
                } else {
                    self.on_failure(&mut inner, now, &mut transitions);
                }
            }
        }
        self.emit(&transitions);
    }

    fn on_success(
        &self,
        inner: &mut BreakerInner,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        match inner.state {
            BreakerState::Closed => inner.counts.on_success(),
            BreakerState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.policy.configured_max_requests() {
                    self.set_state(inner, BreakerState::Closed, now, transitions);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(
        &self,
        inner: &mut BreakerInner,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        match inner.state {
            BreakerState::Closed => {
                inner.counts.on_failure();
                if self.policy.ready_to_trip(&inner.counts) {
                    self.set_state(inner, BreakerState::Open, now, transitions);
                }
            }
            BreakerState::HalfOpen => {
                self.set_state(inner, BreakerState::Open, now, transitions);
            }
            BreakerState::Open => {}
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant, transitions: &mut Vec<Transition>) {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    start_generation(&self.policy, inner, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, BreakerState::HalfOpen, now, transitions);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn set_state(
        &self,
        inner: &mut BreakerInner,
        state: BreakerState,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        if inner.state == state {
            return;
        }
        let from = inner.state;
        inner.state = state;
        start_generation(&self.policy, inner, now);
        transitions.push(Transition { from, to: state });
    }

    fn emit(&self, transitions: &[Transition]) {
        for transition in transitions {
            info!(
                from = transition.from.as_str(),
                to = transition.to.as_str(),
                "circuit breaker state changed"
            );
            self.observer
                .on_breaker_transition(transition.from, transition.to);
        }
    }
}

fn start_generation(policy: &CircuitBreakerPolicy, inner: &mut BreakerInner, now: Instant) {
    inner.generation = inner.generation.wrapping_add(1);
    inner.counts = BreakerCounts::default();
    inner.expiry = match inner.state {
        BreakerState::Closed if policy.interval.is_zero() => None,
        BreakerState::Closed => Some(now + policy.interval),
        BreakerState::Open => Some(now + policy.open_timeout),
        BreakerState::HalfOpen => None,
    };
}

pub struct CircuitAttempt {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    completed: bool,
}

impl std::fmt::Debug for CircuitAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitAttempt")
            .field("generation", &self.generation)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl CircuitAttempt {
    pub fn mark_success(mut self) {
        self.breaker.record(self.generation, true);
        self.completed = true;
    }

    pub fn mark_failure(mut self) {
        self.breaker.record(self.generation, false);
        self.completed = true;
    }
}

impl Drop for CircuitAttempt {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.record(self.generation, false);
            self.completed = true;
        }
    }
}
