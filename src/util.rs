use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::RETRY_AFTER;

use crate::error::TransportErrorKind;

const MAX_ERROR_BODY_LEN: usize = 2048;
const REDACTED_TOKEN_SEGMENT: &str = "bot<redacted>";

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// `{base}/bot{token}/{method}`.
pub(crate) fn method_uri(base_url: &str, token: &str, method: &str) -> String {
    join_base_path(base_url, &format!("bot{token}/{method}"))
}

/// `{base}/bot<redacted>/{method}`; safe to log.
pub(crate) fn redacted_method_uri(base_url: &str, method: &str) -> String {
    redact_uri_for_logs(&join_base_path(
        base_url,
        &format!("{REDACTED_TOKEN_SEGMENT}/{method}"),
    ))
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        let without_query = uri_text.split('?').next().unwrap_or(uri_text);
        return redact_token_segments(without_query);
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);

    let path = redact_token_segments(parsed.path());
    parsed.set_path(&path);

    // `Url` percent-encodes the angle brackets of the placeholder.
    parsed
        .to_string()
        .replace("bot%3Credacted%3E", REDACTED_TOKEN_SEGMENT)
}

fn redact_token_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix("bot") {
            Some(rest) if !rest.is_empty() && rest.contains(':') => REDACTED_TOKEN_SEGMENT,
            _ => segment,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    if chain_has_timeout(error) {
        return TransportErrorKind::Timeout;
    }
    if error.is_connect() {
        let text = error_chain_text(error);
        if text.contains("timed out") {
            return TransportErrorKind::Timeout;
        }
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error_chain_text(error);
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// True when any error in the chain is an I/O timeout, such as the
/// connector's own connect timeout.
pub(crate) fn chain_has_timeout(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(inner) = current {
        if let Some(io_error) = inner.downcast_ref::<std::io::Error>()
            && io_error.kind() == std::io::ErrorKind::TimedOut
        {
            return true;
        }
        current = inner.source();
    }
    false
}

fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_ascii_lowercase()
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
