//! `sendx` delivers Telegram Bot API messages through a resilient pipeline:
//! rate limiter, circuit breaker, HTTP execution, error classification and
//! retry with backoff.
//!
//! # Quick Start
//!
//! ```no_run
//! use sendx::prelude::{SendMessageRequest, Sender, SenderConfig, ParseMode};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sender = Sender::new(SenderConfig::from_env()?)?;
//!     let cancel = CancellationToken::new();
//!
//!     let message = sender
//!         .send_message(
//!             &cancel,
//!             &SendMessageRequest::new(123456789, "<b>deploy finished</b>")
//!                 .parse_mode(ParseMode::Html)
//!                 .disable_web_page_preview(true),
//!         )
//!         .await?;
//!
//!     println!("sent message_id={}", message.message_id);
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Build one `Sender` per bot and clone it; clones share the limiter and breaker.
//! - Bound each send with a cancellation token or `send_message_within`.
//! - Keep `max_retries` small; a 429 already waits as long as the server asks.

mod api;
mod backoff;
mod client;
mod config;
mod error;
mod metrics;
mod observe;
mod rate_limit;
mod resilience;
mod retry;
mod transport;
mod util;

pub use crate::api::{
    ApiEnvelope, Chat, Message, ParseMode, ResponseParameters, SEND_MESSAGE_METHOD,
    SendMessageRequest,
};
pub use crate::backoff::BackoffPolicy;
pub use crate::client::{Sender, SenderBuilder};
pub use crate::config::{DEFAULT_BASE_URL, DEFAULT_LOG_FILE_PATH, SenderConfig};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::SenderMetricsSnapshot;
pub use crate::observe::{NoopObserver, Observer, RetryEvent, WaitSource};
pub use crate::rate_limit::RateLimitPolicy;
pub use crate::resilience::{
    BreakerCounts, BreakerState, CircuitAttempt, CircuitBreaker, CircuitBreakerPolicy,
    CircuitRejection,
};
pub use crate::retry::{
    RETRYABLE_API_CODES, RetryClassifier, RetryVerdict, StandardRetryClassifier,
    error_code_from_text, is_retryable_api_code,
};

pub type SendxResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BreakerState, Error, ErrorCode, Message, Observer, ParseMode, RetryClassifier, RetryEvent,
        RetryVerdict, SendMessageRequest, Sender, SenderBuilder, SenderConfig,
        SenderMetricsSnapshot, SendxResult, StandardRetryClassifier, WaitSource,
    };
}
