use std::time::Duration;

use thiserror::Error;

use crate::resilience::BreakerState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    /// Connection setup or I/O gave up waiting, below the request timeout.
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidConfig,
    RateLimitCancelled,
    Cancelled,
    DeadlineExceeded,
    CircuitOpen,
    Transport,
    Timeout,
    ReadBody,
    HttpStatus,
    Api,
    Deserialize,
    SerializeJson,
    RequestBuild,
    TlsBackendInit,
    RetriesExhausted,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::RateLimitCancelled => "rate_limit_cancelled",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::CircuitOpen => "circuit_open",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ReadBody => "read_body",
            Self::HttpStatus => "http_status",
            Self::Api => "api",
            Self::Deserialize => "deserialize",
            Self::SerializeJson => "serialize_json",
            Self::RequestBuild => "request_build",
            Self::TlsBackendInit => "tls_backend_init",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Terminal failure of a send operation.
///
/// URIs carried by variants are always the redacted form; the bot token never
/// appears in a message or field.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration for {field}: {message}")]
    InvalidConfig { field: &'static str, message: String },
    #[error("rate limit wait cancelled for {method}")]
    RateLimitCancelled { method: String },
    #[error("send cancelled for {method} after {attempts} attempt(s)")]
    Cancelled { method: String, attempts: usize },
    #[error("send deadline exceeded after {timeout_ms}ms for {method}")]
    DeadlineExceeded { timeout_ms: u128, method: String },
    #[error("circuit breaker is {state} for {method}; retry after {retry_after_ms}ms")]
    CircuitOpen {
        method: String,
        state: BreakerState,
        retry_after_ms: u128,
    },
    #[error("http transport error ({kind}) for POST {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for POST {uri}")]
    Timeout { timeout_ms: u128, uri: String },
    #[error("failed to read response body from {uri}: {source}")]
    ReadBody {
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http status error {status} for POST {uri}: {body}")]
    HttpStatus {
        status: u16,
        uri: String,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("api error {error_code} for {method}: {description}")]
    Api {
        method: String,
        error_code: i64,
        description: String,
        retry_after: Option<Duration>,
    },
    #[error("failed to decode response json from {uri}: {source}; body={body}")]
    Deserialize {
        uri: String,
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to initialize tls backend: {message}")]
    TlsBackendInit { message: String },
    #[error("retries exhausted for {method} after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        method: String,
        attempts: usize,
        #[source]
        last: Box<Error>,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::RateLimitCancelled { .. } => ErrorCode::RateLimitCancelled,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Api { .. } => ErrorCode::Api,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::Serialize { .. } => ErrorCode::SerializeJson,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
        }
    }

    /// Error code reported by the remote, either in the envelope or as the raw
    /// HTTP status of a non-envelope error page.
    pub fn api_error_code(&self) -> Option<i64> {
        match self {
            Self::Api { error_code, .. } => Some(*error_code),
            Self::HttpStatus { status, .. } => Some(i64::from(*status)),
            Self::RetriesExhausted { last, .. } => last.api_error_code(),
            _ => None,
        }
    }

    /// Server-declared wait carried by this failure, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } | Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::RateLimitCancelled { .. } | Self::Cancelled { .. } | Self::DeadlineExceeded { .. }
        )
    }

    /// Failure of the final attempt when retries ran out, otherwise `self`.
    pub fn last_attempt_error(&self) -> &Error {
        match self {
            Self::RetriesExhausted { last, .. } => last.last_attempt_error(),
            other => other,
        }
    }

    pub(crate) fn invalid_config(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            message: message.into(),
        }
    }
}
