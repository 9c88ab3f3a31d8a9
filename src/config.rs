use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::Error;
use crate::rate_limit::RateLimitPolicy;
use crate::resilience::CircuitBreakerPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";
pub const DEFAULT_LOG_FILE_PATH: &str = "logs/sendx.log";

const MIN_TOKEN_SECRET_LEN: usize = 30;

/// Settings for a [`Sender`](crate::Sender).
///
/// Built once (from code or [`SenderConfig::from_env`]), validated, then read-only
/// for the lifetime of the client.
#[derive(Clone)]
pub struct SenderConfig {
    pub bot_token: String,
    pub base_url: String,
    pub client_name: String,

    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub max_idle_conns: usize,
    pub idle_conn_timeout: Duration,

    pub rate_limit_requests: f64,
    pub rate_limit_burst: usize,
    pub max_throttle_delay: Duration,

    pub breaker_max_requests: u32,
    pub breaker_min_requests: u32,
    pub breaker_failure_ratio: f64,
    pub breaker_interval: Duration,
    pub breaker_timeout: Duration,

    pub max_retries: usize,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub retry_backoff_factor: f64,

    pub log_file_path: PathBuf,
}

impl std::fmt::Debug for SenderConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SenderConfig")
            .field("bot_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("client_name", &self.client_name)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("idle_conn_timeout", &self.idle_conn_timeout)
            .field("rate_limit_requests", &self.rate_limit_requests)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("max_throttle_delay", &self.max_throttle_delay)
            .field("breaker_max_requests", &self.breaker_max_requests)
            .field("breaker_min_requests", &self.breaker_min_requests)
            .field("breaker_failure_ratio", &self.breaker_failure_ratio)
            .field("breaker_interval", &self.breaker_interval)
            .field("breaker_timeout", &self.breaker_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .field("retry_max_backoff", &self.retry_max_backoff)
            .field("retry_backoff_factor", &self.retry_backoff_factor)
            .field("log_file_path", &self.log_file_path)
            .finish()
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            client_name: "sendx".to_owned(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            max_idle_conns: 10,
            idle_conn_timeout: Duration::from_secs(90),
            rate_limit_requests: 10.0,
            rate_limit_burst: 20,
            max_throttle_delay: Duration::from_secs(30),
            breaker_max_requests: 5,
            breaker_min_requests: 5,
            breaker_failure_ratio: 0.5,
            breaker_interval: Duration::from_secs(120),
            breaker_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(10),
            retry_backoff_factor: 2.0,
            log_file_path: PathBuf::from(DEFAULT_LOG_FILE_PATH),
        }
    }
}

impl SenderConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            ..Self::default()
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn max_idle_conns(mut self, max_idle_conns: usize) -> Self {
        self.max_idle_conns = max_idle_conns;
        self
    }

    pub fn idle_conn_timeout(mut self, idle_conn_timeout: Duration) -> Self {
        self.idle_conn_timeout = idle_conn_timeout;
        self
    }

    pub fn rate_limit(mut self, requests_per_second: f64, burst: usize) -> Self {
        self.rate_limit_requests = requests_per_second;
        self.rate_limit_burst = burst;
        self
    }

    pub fn max_throttle_delay(mut self, max_throttle_delay: Duration) -> Self {
        self.max_throttle_delay = max_throttle_delay;
        self
    }

    pub fn breaker_max_requests(mut self, breaker_max_requests: u32) -> Self {
        self.breaker_max_requests = breaker_max_requests;
        self
    }

    pub fn breaker_min_requests(mut self, breaker_min_requests: u32) -> Self {
        self.breaker_min_requests = breaker_min_requests;
        self
    }

    pub fn breaker_failure_ratio(mut self, breaker_failure_ratio: f64) -> Self {
        self.breaker_failure_ratio = breaker_failure_ratio;
        self
    }

    pub fn breaker_interval(mut self, breaker_interval: Duration) -> Self {
        self.breaker_interval = breaker_interval;
        self
    }

    pub fn breaker_timeout(mut self, breaker_timeout: Duration) -> Self {
        self.breaker_timeout = breaker_timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_backoff(mut self, initial: Duration, max: Duration, factor: f64) -> Self {
        self.retry_initial_backoff = initial;
        self.retry_max_backoff = max;
        self.retry_backoff_factor = factor;
        self
    }

    pub fn log_file_path(mut self, log_file_path: impl Into<PathBuf>) -> Self {
        self.log_file_path = log_file_path.into();
        self
    }

    /// Loads settings from process environment variables, falling back to defaults.
    pub fn from_env() -> crate::SendxResult<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`SenderConfig::from_env`] with a custom variable lookup.
    pub fn from_env_with<F>(lookup: F) -> crate::SendxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| lookup(key).map(|value| value.trim().to_owned());

        Ok(Self {
            bot_token: read("BOT_TOKEN").unwrap_or_default(),
            base_url: read("BASE_URL").unwrap_or(defaults.base_url),
            client_name: read("CLIENT_NAME").unwrap_or(defaults.client_name),
            request_timeout: env_duration(&read, "REQUEST_TIMEOUT", defaults.request_timeout)?,
            connect_timeout: env_duration(&read, "CONNECT_TIMEOUT", defaults.connect_timeout)?,
            keep_alive: env_duration(&read, "KEEP_ALIVE", defaults.keep_alive)?,
            max_idle_conns: env_parsed(&read, "MAX_IDLE_CONNS", defaults.max_idle_conns)?,
            idle_conn_timeout: env_duration(
                &read,
                "IDLE_CONN_TIMEOUT",
                defaults.idle_conn_timeout,
            )?,
            rate_limit_requests: env_parsed(
                &read,
                "RATE_LIMIT_REQUESTS",
                defaults.rate_limit_requests,
            )?,
            rate_limit_burst: env_parsed(&read, "RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            max_throttle_delay: env_duration(
                &read,
                "MAX_THROTTLE_DELAY",
                defaults.max_throttle_delay,
            )?,
            breaker_max_requests: env_parsed(
                &read,
                "BREAKER_MAX_REQUESTS",
                defaults.breaker_max_requests,
            )?,
            breaker_min_requests: env_parsed(
                &read,
                "BREAKER_MIN_REQUESTS",
                defaults.breaker_min_requests,
            )?,
            breaker_failure_ratio: env_parsed(
                &read,
                "BREAKER_FAILURE_RATIO",
                defaults.breaker_failure_ratio,
            )?,
            breaker_interval: env_duration(&read, "BREAKER_INTERVAL", defaults.breaker_interval)?,
            breaker_timeout: env_duration(&read, "BREAKER_TIMEOUT", defaults.breaker_timeout)?,
            max_retries: env_parsed(&read, "MAX_RETRIES", defaults.max_retries)?,
            retry_initial_backoff: env_duration(
                &read,
                "RETRY_INITIAL_BACKOFF",
                defaults.retry_initial_backoff,
            )?,
            retry_max_backoff: env_duration(
                &read,
                "RETRY_MAX_BACKOFF",
                defaults.retry_max_backoff,
            )?,
            retry_backoff_factor: env_parsed(
                &read,
                "RETRY_BACKOFF_FACTOR",
                defaults.retry_backoff_factor,
            )?,
            log_file_path: read("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file_path),
        })
    }

    /// Pre-flight sanity checks. Nothing touches the network before this passes.
    pub fn validate(&self) -> crate::SendxResult<()> {
        if self.bot_token.is_empty() {
            return Err(Error::invalid_config("bot_token", "BOT_TOKEN must be set"));
        }
        if !is_valid_bot_token(&self.bot_token) {
            return Err(Error::invalid_config("bot_token", "BOT_TOKEN format is invalid"));
        }
        if self.base_url.is_empty() {
            return Err(Error::invalid_config("base_url", "BASE_URL must be set"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::invalid_config("base_url", "BASE_URL must use http:// or https://"));
        }
        if self.log_file_path.as_os_str().is_empty() {
            return Err(Error::invalid_config("log_file_path", "LOG_FILE_PATH must be set"));
        }

        require_positive("request_timeout", self.request_timeout)?;
        require_positive("connect_timeout", self.connect_timeout)?;
        require_positive("keep_alive", self.keep_alive)?;
        require_positive("idle_conn_timeout", self.idle_conn_timeout)?;
        require_positive("max_throttle_delay", self.max_throttle_delay)?;
        require_positive("breaker_interval", self.breaker_interval)?;
        require_positive("breaker_timeout", self.breaker_timeout)?;
        require_positive("retry_initial_backoff", self.retry_initial_backoff)?;
        require_positive("retry_max_backoff", self.retry_max_backoff)?;

        if !(self.rate_limit_requests.is_finite() && self.rate_limit_requests > 0.0) {
            return Err(Error::invalid_config(
                "rate_limit_requests",
                "RATE_LIMIT_REQUESTS must be positive",
            ));
        }
        if self.rate_limit_burst == 0 {
            return Err(Error::invalid_config(
                "rate_limit_burst",
                "RATE_LIMIT_BURST must be positive",
            ));
        }
        if self.breaker_max_requests == 0 {
            return Err(Error::invalid_config(
                "breaker_max_requests",
                "BREAKER_MAX_REQUESTS must be positive",
            ));
        }
        if !(self.breaker_failure_ratio.is_finite()
            && self.breaker_failure_ratio > 0.0
            && self.breaker_failure_ratio <= 1.0)
        {
            return Err(Error::invalid_config(
                "breaker_failure_ratio",
                "BREAKER_FAILURE_RATIO must be within (0, 1]",
            ));
        }
        if !(self.retry_backoff_factor.is_finite() && self.retry_backoff_factor > 0.0) {
            return Err(Error::invalid_config(
                "retry_backoff_factor",
                "RETRY_BACKOFF_FACTOR must be positive",
            ));
        }
        Ok(())
    }

    pub(crate) fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::standard()
            .requests_per_second(self.rate_limit_requests)
            .burst(self.rate_limit_burst)
            .max_throttle_delay(self.max_throttle_delay)
    }

    pub(crate) fn circuit_breaker_policy(&self) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::standard()
            .max_requests(self.breaker_max_requests)
            .min_requests(self.breaker_min_requests)
            .failure_ratio(self.breaker_failure_ratio)
            .interval(self.breaker_interval)
            .open_timeout(self.breaker_timeout)
    }

    pub(crate) fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::standard()
            .initial(self.retry_initial_backoff)
            .multiplier(self.retry_backoff_factor)
            .ceiling(self.retry_max_backoff)
    }
}

fn require_positive(field: &'static str, value: Duration) -> crate::SendxResult<()> {
    if value.is_zero() {
        return Err(Error::invalid_config(field, "must be positive"));
    }
    Ok(())
}

/// `<numeric bot id>:<secret>` where the secret is at least 30 characters.
pub(crate) fn is_valid_bot_token(token: &str) -> bool {
    if token.len() < 10 {
        return false;
    }
    let Some((bot_id, secret)) = token.split_once(':') else {
        return false;
    };
    if secret.contains(':') {
        return false;
    }
    if bot_id.parse::<i64>().is_err() {
        return false;
    }
    secret.len() >= MIN_TOKEN_SECRET_LEN
}

fn env_parsed<T, R>(read: &R, key: &'static str, default: T) -> crate::SendxResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    R: Fn(&str) -> Option<String>,
{
    match read(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|source| Error::invalid_config(key, format!("{raw:?}: {source}"))),
    }
}

fn env_duration<R>(read: &R, key: &'static str, default: Duration) -> crate::SendxResult<Duration>
where
    R: Fn(&str) -> Option<String>,
{
    match read(key) {
        None => Ok(default),
        Some(raw) => parse_duration(&raw)
            .ok_or_else(|| Error::invalid_config(key, format!("invalid duration {raw:?}"))),
    }
}

/// Parses duration literals such as `100ms`, `10s`, `2m`, `1h` or `1m30s`.
pub(crate) fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_len = rest
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let number = &rest[..number_len];
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|ch: char| ch.is_ascii_digit() || ch == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return None,
        };
        rest = &rest[unit_len..];

        let part = if number.contains('.') {
            let value: f64 = number.parse().ok()?;
            Duration::try_from_secs_f64(value * nanos_per_unit as f64 / 1e9).ok()?
        } else {
            let value: u64 = number.parse().ok()?;
            Duration::from_nanos(value.checked_mul(nanos_per_unit)?)
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}
