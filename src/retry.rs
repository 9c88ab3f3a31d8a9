use std::time::Duration;

use crate::error::{Error, TransportErrorKind};

/// Remote error codes worth another attempt.
pub const RETRYABLE_API_CODES: [i64; 5] = [429, 500, 502, 503, 504];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryVerdict {
    pub retryable: bool,
    /// Server-declared wait that overrides computed backoff.
    pub retry_after: Option<Duration>,
}

impl RetryVerdict {
    pub const fn retry() -> Self {
        Self {
            retryable: true,
            retry_after: None,
        }
    }

    pub const fn retry_after(delay: Duration) -> Self {
        Self {
            retryable: true,
            retry_after: Some(delay),
        }
    }

    pub const fn stop() -> Self {
        Self {
            retryable: false,
            retry_after: None,
        }
    }
}

pub trait RetryClassifier: Send + Sync {
    fn classify(&self, error: &Error) -> RetryVerdict;
}

/// Timeouts, circuit rejections and remote codes 429/500/502/503/504 retry;
/// everything else, cancellation included, is terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRetryClassifier;

impl RetryClassifier for StandardRetryClassifier {
    fn classify(&self, error: &Error) -> RetryVerdict {
        match error {
            Error::Timeout { .. }
            | Error::CircuitOpen { .. }
            | Error::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } => RetryVerdict::retry(),
            Error::Api {
                error_code,
                retry_after,
                ..
            } => classify_remote_code(*error_code, *retry_after),
            Error::HttpStatus {
                status,
                retry_after,
                ..
            } => classify_remote_code(i64::from(*status), *retry_after),
            _ => RetryVerdict::stop(),
        }
    }
}

fn classify_remote_code(code: i64, retry_after: Option<Duration>) -> RetryVerdict {
    if !is_retryable_api_code(code) {
        return RetryVerdict::stop();
    }
    match retry_after {
        Some(delay) if !delay.is_zero() => RetryVerdict::retry_after(delay),
        _ => RetryVerdict::retry(),
    }
}

pub fn is_retryable_api_code(code: i64) -> bool {
    RETRYABLE_API_CODES.contains(&code)
}

/// Best-effort error code recovery from a free-text description.
///
/// Only used when the remote answered `ok: false` without an `error_code` and
/// with a 2xx status, so there is no structured code to inspect. Matches are
/// lower confidence than the structured path.
pub fn error_code_from_text(text: &str) -> Option<i64> {
    const REASON_PHRASES: [(&str, i64); 9] = [
        ("too many requests", 429),
        ("retry after", 429),
        ("internal server error", 500),
        ("bad gateway", 502),
        ("service unavailable", 503),
        ("gateway timeout", 504),
        ("unauthorized", 401),
        ("forbidden", 403),
        ("not found", 404),
    ];

    let lowered = text.to_ascii_lowercase();
    let mut rest = lowered.as_str();
    while let Some(start) = rest.find(|ch: char| ch.is_ascii_digit()) {
        let (prefix, tail) = rest.split_at(start);
        let end = tail
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(tail.len());
        let token = &tail[..end];
        // A wait in seconds, not a status.
        let is_wait = prefix.trim_end().ends_with("retry after");
        if !is_wait
            && token.len() == 3
            && let Ok(code) = token.parse::<i64>()
            && (400..600).contains(&code)
        {
            return Some(code);
        }
        rest = &tail[end..];
    }

    REASON_PHRASES
        .iter()
        .find(|(phrase, _)| lowered.contains(phrase))
        .map(|(_, code)| *code)
}

/// Whether a finished attempt should count against the circuit breaker.
///
/// A coherent 4xx answer (429 included) shows the remote is healthy.
pub(crate) fn counts_as_breaker_failure(error: &Error) -> bool {
    match error {
        Error::Transport { .. }
        | Error::Timeout { .. }
        | Error::ReadBody { .. }
        | Error::Deserialize { .. } => true,
        Error::Api { error_code, .. } => *error_code >= 500,
        Error::HttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        RetryClassifier, RetryVerdict, StandardRetryClassifier, counts_as_breaker_failure,
        error_code_from_text,
    };
    use crate::error::{Error, TransportErrorKind};
    use crate::resilience::BreakerState;

    fn api(code: i64, retry_after: Option<Duration>) -> Error {
        Error::Api {
            method: "sendMessage".to_owned(),
            error_code: code,
            description: "test".to_owned(),
            retry_after,
        }
    }

    #[test]
    fn retryable_api_codes_are_retried() {
        let classifier = StandardRetryClassifier;
        for code in [429, 500, 502, 503, 504] {
            assert!(classifier.classify(&api(code, None)).retryable, "code {code}");
        }
    }

    #[test]
    fn client_errors_are_terminal() {
        let classifier = StandardRetryClassifier;
        for code in [400, 401, 403, 404, 501] {
            assert_eq!(classifier.classify(&api(code, None)), RetryVerdict::stop());
        }
    }

    #[test]
    fn server_hint_is_carried_for_throttling() {
        let verdict = StandardRetryClassifier.classify(&api(429, Some(Duration::from_secs(5))));
        assert_eq!(verdict, RetryVerdict::retry_after(Duration::from_secs(5)));

        let zero_hint = StandardRetryClassifier.classify(&api(429, Some(Duration::ZERO)));
        assert_eq!(zero_hint, RetryVerdict::retry());
    }

    #[test]
    fn timeouts_retry_and_other_transport_errors_do_not() {
        let classifier = StandardRetryClassifier;
        let timeout = Error::Timeout {
            timeout_ms: 10,
            uri: "http://127.0.0.1/bot<redacted>/sendMessage".to_owned(),
        };
        let connect = Error::Transport {
            kind: TransportErrorKind::Connect,
            uri: "http://127.0.0.1/bot<redacted>/sendMessage".to_owned(),
            source: "connection refused".into(),
        };

        assert!(classifier.classify(&timeout).retryable);
        assert!(!classifier.classify(&connect).retryable);
    }

    #[test]
    fn cancellation_and_circuit_rejection() {
        let classifier = StandardRetryClassifier;
        let cancelled = Error::Cancelled {
            method: "sendMessage".to_owned(),
            attempts: 1,
        };
        let deadline = Error::DeadlineExceeded {
            timeout_ms: 100,
            method: "sendMessage".to_owned(),
        };
        let open = Error::CircuitOpen {
            method: "sendMessage".to_owned(),
            state: BreakerState::Open,
            retry_after_ms: 1_000,
        };

        assert!(!classifier.classify(&cancelled).retryable);
        assert!(!classifier.classify(&deadline).retryable);
        assert!(classifier.classify(&open).retryable);
    }

    #[test]
    fn text_fallback_recovers_codes() {
        assert_eq!(error_code_from_text("Too Many Requests: retry later"), Some(429));
        assert_eq!(error_code_from_text("upstream said 503"), Some(503));
        assert_eq!(error_code_from_text("Bad Gateway"), Some(502));
        assert_eq!(error_code_from_text("chat 123456789 is gone"), None);
        assert_eq!(error_code_from_text("something odd happened"), None);
    }

    #[test]
    fn text_fallback_skips_retry_after_seconds() {
        assert_eq!(
            error_code_from_text("Too Many Requests: retry after 450"),
            Some(429)
        );
        assert_eq!(error_code_from_text("retry after 120, status 503"), Some(503));
    }

    #[test]
    fn transport_timeouts_retry() {
        let connect_timeout = Error::Transport {
            kind: TransportErrorKind::Timeout,
            uri: "http://127.0.0.1/bot<redacted>/sendMessage".to_owned(),
            source: "tcp connect error: connection timed out".into(),
        };

        assert!(StandardRetryClassifier.classify(&connect_timeout).retryable);
        assert!(counts_as_breaker_failure(&connect_timeout));
    }

    #[test]
    fn breaker_accounting_ignores_client_errors() {
        assert!(counts_as_breaker_failure(&api(503, None)));
        assert!(!counts_as_breaker_failure(&api(429, None)));
        assert!(!counts_as_breaker_failure(&api(400, None)));
        assert!(counts_as_breaker_failure(&Error::Timeout {
            timeout_ms: 1,
            uri: String::new(),
        }));
    }
}
