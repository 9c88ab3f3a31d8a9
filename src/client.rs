use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::api::{Message, SEND_MESSAGE_METHOD, SendMessageRequest};
use crate::backoff::BackoffPolicy;
use crate::config::SenderConfig;
use crate::error::Error;
use crate::metrics::{SenderMetrics, SenderMetricsSnapshot};
use crate::observe::{NoopObserver, Observer, RetryEvent, WaitSource};
use crate::rate_limit::RateLimiter;
use crate::resilience::{BreakerCounts, BreakerState, CircuitBreaker};
use crate::retry::{RetryClassifier, StandardRetryClassifier, counts_as_breaker_failure};
use crate::transport::Transport;

pub struct SenderBuilder {
    config: SenderConfig,
    observer: Option<Arc<dyn Observer>>,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl SenderBuilder {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            observer: None,
            retry_classifier: None,
        }
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    /// Validates the configuration and builds the shared pipeline state.
    pub fn build(self) -> crate::SendxResult<Sender> {
        self.config.validate()?;

        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(NoopObserver) as Arc<dyn Observer>);
        let retry_classifier = self
            .retry_classifier
            .unwrap_or_else(|| Arc::new(StandardRetryClassifier) as Arc<dyn RetryClassifier>);
        let transport = Transport::new(&self.config)?;
        let rate_limiter = RateLimiter::new(self.config.rate_limit_policy());
        let breaker = Arc::new(CircuitBreaker::with_observer(
            self.config.circuit_breaker_policy(),
            Arc::clone(&observer),
        ));
        let backoff = self.config.backoff_policy();

        Ok(Sender {
            inner: Arc::new(SenderInner {
                config: self.config,
                transport,
                rate_limiter,
                breaker,
                backoff,
                retry_classifier,
                observer,
                metrics: SenderMetrics::default(),
            }),
        })
    }
}

struct SenderInner {
    config: SenderConfig,
    transport: Transport,
    rate_limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffPolicy,
    retry_classifier: Arc<dyn RetryClassifier>,
    observer: Arc<dyn Observer>,
    metrics: SenderMetrics,
}

/// Resilient Bot API client.
///
/// Every send goes through the shared rate limiter and circuit breaker, then
/// retries transient failures with backoff. Clones share all of that state.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Sender")
            .field("config", &self.inner.config)
            .field("breaker_state", &self.inner.breaker.state())
            .finish_non_exhaustive()
    }
}

impl Sender {
    pub fn new(config: SenderConfig) -> crate::SendxResult<Self> {
        SenderBuilder::new(config).build()
    }

    pub fn builder(config: SenderConfig) -> SenderBuilder {
        SenderBuilder::new(config)
    }

    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    pub fn breaker_counts(&self) -> BreakerCounts {
        self.inner.breaker.counts()
    }

    pub fn metrics_snapshot(&self) -> SenderMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn send_message(
        &self,
        cancel: &CancellationToken,
        request: &SendMessageRequest,
    ) -> crate::SendxResult<Message> {
        self.call(cancel, SEND_MESSAGE_METHOD, request).await
    }

    /// [`Sender::send_message`] bounded by a total deadline covering every
    /// attempt and wait.
    pub async fn send_message_within(
        &self,
        total: Duration,
        request: &SendMessageRequest,
    ) -> crate::SendxResult<Message> {
        let cancel = CancellationToken::new();
        match timeout(total, self.send_message(&cancel, request)).await {
            Ok(result) => result,
            Err(_) => {
                let error = Error::DeadlineExceeded {
                    timeout_ms: total.as_millis(),
                    method: SEND_MESSAGE_METHOD.to_owned(),
                };
                warn!(error = %error, "send deadline exceeded");
                self.inner
                    .observer
                    .on_send_failed(SEND_MESSAGE_METHOD, &error);
                Err(error)
            }
        }
    }

    /// Runs any Bot API `method` through the full pipeline.
    pub async fn call<P, T>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        payload: &P,
    ) -> crate::SendxResult<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let metrics = &self.inner.metrics;
        let _in_flight = metrics.record_send_started();
        let started = Instant::now();

        let result = self.call_with_retry(cancel, method, payload).await;
        metrics.record_send_completed(&result, started.elapsed());
        match result {
            Ok((value, attempts)) => {
                self.inner.observer.on_send_succeeded(method, attempts);
                Ok(value)
            }
            Err(error) => {
                self.inner.observer.on_send_failed(method, &error);
                Err(error)
            }
        }
    }

    async fn call_with_retry<P, T>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        payload: &P,
    ) -> crate::SendxResult<(T, usize)>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let inner = &self.inner;
        inner.config.validate()?;

        let body = serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|source| Error::Serialize { source })?;
        let redacted_uri = inner.transport.redacted_uri(method);
        let max_attempts = inner.config.max_retries.saturating_add(1);
        let mut attempt = 1_usize;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    method: method.to_owned(),
                    attempts: attempt - 1,
                });
            }

            let span = info_span!(
                "sendx.attempt",
                client = %inner.config.client_name,
                method = method,
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let outcome = self
                .run_attempt::<T>(cancel, method, attempt, body.clone())
                .instrument(span.clone())
                .await;
            let error = match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(error) => error,
            };
            let delay = span.in_scope(|| {
                self.plan_retry(method, &redacted_uri, attempt, max_attempts, error)
            })?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        method: method.to_owned(),
                        attempts: attempt,
                    });
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Classifies a failed attempt and picks the wait before the next one, or
    /// returns the terminal error.
    fn plan_retry(
        &self,
        method: &str,
        redacted_uri: &str,
        attempt: usize,
        max_attempts: usize,
        error: Error,
    ) -> crate::SendxResult<Duration> {
        let inner = &self.inner;
        if error.is_cancellation() {
            debug!(error = %error, "send cancelled");
            return Err(error);
        }

        inner.metrics.record_attempt_error(&error);
        let verdict = inner.retry_classifier.classify(&error);
        if error.api_error_code() == Some(429)
            && let Some(delay) = verdict.retry_after
        {
            inner.rate_limiter.observe_server_throttle(delay);
        }

        if attempt >= max_attempts {
            warn!(attempts = attempt, error = %error, "retries exhausted");
            return Err(Error::RetriesExhausted {
                method: method.to_owned(),
                attempts: attempt,
                last: Box::new(error),
            });
        }
        if !verdict.retryable {
            warn!(error = %error, "non-retryable error");
            return Err(error);
        }

        let (delay, wait_source) = match verdict.retry_after {
            Some(delay) if !delay.is_zero() => (
                delay.min(inner.config.max_throttle_delay),
                WaitSource::Server,
            ),
            _ => (inner.backoff.delay_for(attempt), WaitSource::Computed),
        };
        warn!(
            delay_ms = delay.as_millis() as u64,
            wait_source = wait_source.as_str(),
            next_attempt = attempt + 1,
            error = %error,
            "retrying request"
        );
        inner
            .metrics
            .record_retry(wait_source == WaitSource::Server);
        inner.observer.on_retry_scheduled(&RetryEvent {
            method: method.to_owned(),
            uri: redacted_uri.to_owned(),
            attempt: attempt + 1,
            max_attempts,
            delay,
            wait_source,
            error_code: error.code(),
            api_error_code: error.api_error_code(),
        });
        Ok(delay)
    }

    async fn run_attempt<T>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        attempt: usize,
        body: Bytes,
    ) -> crate::SendxResult<T>
    where
        T: DeserializeOwned,
    {
        let inner = &self.inner;

        let waited = inner
            .rate_limiter
            .admit(cancel)
            .await
            .map_err(|_| Error::RateLimitCancelled {
                method: method.to_owned(),
            })?;
        if !waited.is_zero() {
            inner.metrics.record_rate_limit_wait();
        }

        let circuit_attempt = match inner.breaker.begin() {
            Ok(circuit_attempt) => circuit_attempt,
            Err(rejection) => {
                inner.metrics.record_circuit_rejection();
                return Err(Error::CircuitOpen {
                    method: method.to_owned(),
                    state: rejection.state,
                    retry_after_ms: rejection.retry_after.as_millis(),
                });
            }
        };

        inner.metrics.record_attempt();
        debug!("sending request");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The dropped breaker guard records the abandoned call as a failure.
                return Err(Error::Cancelled {
                    method: method.to_owned(),
                    attempts: attempt,
                });
            }
            result = inner.transport.execute::<T>(method, body) => result,
        };

        match &result {
            Err(error) if counts_as_breaker_failure(error) => circuit_attempt.mark_failure(),
            _ => circuit_attempt.mark_success(),
        }
        result
    }
}
