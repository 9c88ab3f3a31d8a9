use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use tracing::debug;

use crate::api::ApiEnvelope;
use crate::config::SenderConfig;
use crate::error::Error;
use crate::retry::error_code_from_text;
use crate::util::{
    classify_transport_error, method_uri, parse_retry_after, redacted_method_uri, truncate_body,
};

const MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const JSON_CONTENT_TYPE: &str = "application/json";

type ReqBody = Full<Bytes>;
type HyperClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ReqBody>;

enum ExchangeError {
    Transport(hyper_util::client::legacy::Error),
    ReadBody(Box<dyn std::error::Error + Send + Sync>),
}

/// One POST per call against `{base}/bot{token}/{method}`; no retries here.
#[derive(Clone)]
pub(crate) struct Transport {
    client: HyperClient,
    base_url: String,
    bot_token: String,
    user_agent: HeaderValue,
    request_timeout: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Transport")
            .field("base_url", &self.base_url)
            .field("bot_token", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Transport {
    pub(crate) fn new(config: &SenderConfig) -> crate::SendxResult<Self> {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_nodelay(true);
        connector.set_keepalive(Some(config.keep_alive));
        connector.set_connect_timeout(Some(config.connect_timeout));

        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| Error::TlsBackendInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_conn_timeout)
            .pool_max_idle_per_host(config.max_idle_conns)
            .build(https);

        let user_agent = HeaderValue::from_str(&config.client_name).map_err(|_| {
            Error::invalid_config("client_name", "client name is not a valid header value")
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            bot_token: config.bot_token.clone(),
            user_agent,
            request_timeout: config.request_timeout,
        })
    }

    pub(crate) fn redacted_uri(&self, method: &str) -> String {
        redacted_method_uri(&self.base_url, method)
    }

    /// Sends `body` to `method` and interprets the envelope.
    ///
    /// The request timeout bounds the whole exchange, body read included.
    pub(crate) async fn execute<T>(&self, method: &str, body: Bytes) -> crate::SendxResult<T>
    where
        T: DeserializeOwned,
    {
        let redacted_uri = self.redacted_uri(method);
        let request = Request::builder()
            .method(Method::POST)
            .uri(method_uri(&self.base_url, &self.bot_token, method))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, JSON_CONTENT_TYPE)
            .header(USER_AGENT, self.user_agent.clone())
            .body(Full::new(body))
            .map_err(|source| Error::RequestBuild { source })?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(ExchangeError::Transport)?;
            let (parts, body) = response.into_parts();
            let body = read_all_body_limited(body, MAX_RESPONSE_BODY_BYTES)
                .await
                .map_err(ExchangeError::ReadBody)?;
            Ok::<_, ExchangeError>((parts.status, parts.headers, body))
        };

        let (status, headers, body) = match timeout(self.request_timeout, exchange).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(ExchangeError::Transport(source))) => {
                return Err(Error::Transport {
                    kind: classify_transport_error(&source),
                    uri: redacted_uri,
                    source: Box::new(source),
                });
            }
            Ok(Err(ExchangeError::ReadBody(source))) => {
                return Err(Error::ReadBody {
                    uri: redacted_uri,
                    source,
                });
            }
            Err(_) => {
                return Err(Error::Timeout {
                    timeout_ms: self.request_timeout.as_millis(),
                    uri: redacted_uri,
                });
            }
        };

        decode_response(
            method,
            &redacted_uri,
            status,
            &headers,
            &body,
            SystemTime::now(),
        )
    }
}

async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            if collected.len().saturating_add(data.len()) > max_bytes {
                return Err(format!("response body exceeds {max_bytes} bytes").into());
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

/// Turns one HTTP answer into the method result or a structured failure.
pub(crate) fn decode_response<T>(
    method: &str,
    redacted_uri: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    now: SystemTime,
) -> crate::SendxResult<T>
where
    T: DeserializeOwned,
{
    let header_retry_after = parse_retry_after(headers, now);

    let mut envelope: ApiEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(source) => {
            if status.is_success() {
                return Err(Error::Deserialize {
                    uri: redacted_uri.to_owned(),
                    source,
                    body: truncate_body(body),
                });
            }
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                uri: redacted_uri.to_owned(),
                body: truncate_body(body),
                retry_after: header_retry_after
                    .filter(|_| status == StatusCode::TOO_MANY_REQUESTS),
            });
        }
    };
    envelope.retry_after = header_retry_after;

    if envelope.ok {
        let result = envelope.result.unwrap_or(serde_json::Value::Null);
        return serde_json::from_value(result).map_err(|source| Error::Deserialize {
            uri: redacted_uri.to_owned(),
            source,
            body: truncate_body(body),
        });
    }

    let description = envelope.description.clone().unwrap_or_default();
    let error_code = envelope
        .error_code
        .or_else(|| (!status.is_success()).then(|| i64::from(status.as_u16())))
        .or_else(|| error_code_from_text(&description))
        .unwrap_or_default();
    let retry_after = if error_code == 429 {
        envelope.effective_retry_after()
    } else {
        None
    };

    debug!(
        method,
        uri = redacted_uri,
        status = status.as_u16(),
        error_code,
        description = %description,
        retry_after_ms = retry_after.map(|delay| delay.as_millis() as u64),
        "api returned an error envelope"
    );

    Err(Error::Api {
        method: method.to_owned(),
        error_code,
        description,
        retry_after,
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::{HeaderMap, HeaderValue, StatusCode};

    use super::decode_response;
    use crate::api::Message;
    use crate::error::Error;

    const URI: &str = "https://api.telegram.org/bot<redacted>/sendMessage";

    fn decode(status: StatusCode, headers: &HeaderMap, body: &str) -> Result<Message, Error> {
        decode_response(
            "sendMessage",
            URI,
            status,
            headers,
            body.as_bytes(),
            SystemTime::now(),
        )
    }

    #[test]
    fn success_envelope_yields_message() {
        let message = decode(
            StatusCode::OK,
            &HeaderMap::new(),
            r#"{"ok":true,"result":{"message_id":77,"date":1,"chat":{"id":5,"type":"private"}}}"#,
        )
        .expect("success envelope should decode");

        assert_eq!(message.message_id, 77);
        assert_eq!(message.chat.map(|chat| chat.id), Some(5));
    }

    #[test]
    fn throttled_envelope_prefers_header_over_body_hint() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        let error = decode(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 9","parameters":{"retry_after":9}}"#,
        )
        .expect_err("429 envelope should fail");

        match error {
            Error::Api {
                error_code,
                retry_after,
                ..
            } => {
                assert_eq!(error_code, 429);
                assert_eq!(retry_after, Some(Duration::from_secs(5)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn body_retry_hint_is_used_without_header() {
        let error = decode(
            StatusCode::TOO_MANY_REQUESTS,
            &HeaderMap::new(),
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":3}}"#,
        )
        .expect_err("429 envelope should fail");

        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_hint_is_ignored_for_other_codes() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        let error = decode(
            StatusCode::UNAUTHORIZED,
            &headers,
            r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#,
        )
        .expect_err("401 envelope should fail");

        assert_eq!(error.api_error_code(), Some(401));
        assert_eq!(error.retry_after(), None);
    }

    #[test]
    fn missing_error_code_falls_back_to_status_then_text() {
        let from_status = decode(
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            r#"{"ok":false,"description":"upstream down"}"#,
        )
        .expect_err("envelope should fail");
        assert_eq!(from_status.api_error_code(), Some(502));

        let from_text = decode(
            StatusCode::OK,
            &HeaderMap::new(),
            r#"{"ok":false,"description":"Service Unavailable"}"#,
        )
        .expect_err("envelope should fail");
        assert_eq!(from_text.api_error_code(), Some(503));
    }

    #[test]
    fn non_json_error_page_becomes_http_status() {
        let error = decode(
            StatusCode::SERVICE_UNAVAILABLE,
            &HeaderMap::new(),
            "<html>maintenance</html>",
        )
        .expect_err("error page should fail");

        match error {
            Error::HttpStatus { status, body, .. } => {
                assert_eq!(status, 503);
                assert!(body.contains("maintenance"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_success_body_is_a_parse_failure() {
        let error = decode(StatusCode::OK, &HeaderMap::new(), "{\"ok\":tru")
            .expect_err("malformed body should fail");
        assert!(matches!(error, Error::Deserialize { .. }));

        let wrong_shape = decode(
            StatusCode::OK,
            &HeaderMap::new(),
            r#"{"ok":true,"result":{"chat":{"id":1}}}"#,
        )
        .expect_err("result without message_id should fail");
        assert!(matches!(wrong_shape, Error::Deserialize { .. }));
    }
}
