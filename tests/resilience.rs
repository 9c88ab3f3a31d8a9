use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sendx::prelude::{
    BreakerState, Error, ErrorCode, Observer, RetryEvent, SendMessageRequest, Sender, SenderConfig,
    WaitSource,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "123456789:ABCDefGhIJKlmNoPQRsTUVwxyZ0123456789";

#[derive(Clone)]
struct ResponseSpec {
    status: u16,
    body: String,
    delay: Duration,
}

impl ResponseSpec {
    fn new(status: u16, body: serde_json::Value, delay: Duration) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay,
        }
    }
}

/// Serves the same response to every connection until dropped.
struct CountingServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    response: Arc<Mutex<ResponseSpec>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CountingServer {
    fn start(response: ResponseSpec) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind counting server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let response = Arc::new(Mutex::new(response));
        let stop = Arc::new(AtomicBool::new(false));
        let served_clone = Arc::clone(&served);
        let response_clone = Arc::clone(&response);
        let stop_clone = Arc::clone(&stop);

        let join = thread::spawn(move || {
            let mut workers = Vec::new();
            while !stop_clone.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let served = Arc::clone(&served_clone);
                        let response = response_clone.lock().expect("lock response").clone();
                        workers.push(thread::spawn(move || {
                            serve_one(stream, &response, &served);
                        }));
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
            for worker in workers {
                let _ = worker.join();
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            response,
            stop,
            join: Some(join),
        }
    }

    fn respond_with(&self, response: ResponseSpec) {
        *self.response.lock().expect("lock response") = response;
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for CountingServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve_one(mut stream: TcpStream, response: &ResponseSpec, served: &AtomicUsize) {
    if read_http_message(&mut stream).is_err() {
        return;
    }
    served.fetch_add(1, Ordering::SeqCst);
    if !response.delay.is_zero() {
        thread::sleep(response.delay);
    }
    let _ = write_http_response(&mut stream, response);
}

fn read_http_message(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    let header_end = loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers",
            ));
        }
        raw.extend_from_slice(&chunk[..read]);
        if let Some(position) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break position;
        }
    };

    let content_length = String::from_utf8_lossy(&raw[..header_end])
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body_len = raw.len() - (header_end + 4);
    while body_len < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body_len += read;
    }
    Ok(())
}

fn write_http_response(stream: &mut TcpStream, response: &ResponseSpec) -> std::io::Result<()> {
    let raw = format!(
        "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        response.body.len(),
        response.body
    );
    stream.write_all(raw.as_bytes())?;
    stream.flush()
}

fn sent() -> ResponseSpec {
    ResponseSpec::new(
        200,
        json!({
            "ok": true,
            "result": { "message_id": 1, "date": 0, "chat": { "id": 42, "type": "private" } }
        }),
        Duration::ZERO,
    )
}

fn unavailable() -> ResponseSpec {
    ResponseSpec::new(
        503,
        json!({ "ok": false, "error_code": 503, "description": "Service Unavailable" }),
        Duration::ZERO,
    )
}

#[derive(Default)]
struct TransitionRecorder {
    transitions: Mutex<Vec<(BreakerState, BreakerState)>>,
}

impl TransitionRecorder {
    fn transitions(&self) -> Vec<(BreakerState, BreakerState)> {
        self.transitions.lock().expect("lock transitions").clone()
    }
}

impl Observer for TransitionRecorder {
    fn on_breaker_transition(&self, from: BreakerState, to: BreakerState) {
        self.transitions
            .lock()
            .expect("lock transitions")
            .push((from, to));
    }
}

#[derive(Default)]
struct RetryRecorder {
    retries: Mutex<Vec<RetryEvent>>,
}

impl RetryRecorder {
    fn retries(&self) -> Vec<RetryEvent> {
        self.retries.lock().expect("lock retries").clone()
    }
}

impl Observer for RetryRecorder {
    fn on_retry_scheduled(&self, event: &RetryEvent) {
        self.retries.lock().expect("lock retries").push(event.clone());
    }
}

fn breaker_config(base_url: &str) -> SenderConfig {
    SenderConfig::new(TOKEN)
        .base_url(base_url)
        .request_timeout(Duration::from_secs(2))
        .max_retries(0)
        .breaker_min_requests(1)
        .breaker_max_requests(1)
        .breaker_timeout(Duration::from_millis(200))
}

async fn wait_for_served_count(server: &CountingServer, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.served_count() < expected && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn breaker_opens_after_failures_and_rejects_without_network() {
    let server = CountingServer::start(unavailable());
    let recorder = Arc::new(TransitionRecorder::default());
    let sender = Sender::builder(
        breaker_config(&server.base_url).breaker_timeout(Duration::from_secs(30)),
    )
    .observer(Arc::clone(&recorder) as Arc<dyn Observer>)
    .build()
    .expect("sender should build");
    let cancel = CancellationToken::new();
    let request = SendMessageRequest::new(42, "hi");

    for _ in 0..2 {
        let error = sender
            .send_message(&cancel, &request)
            .await
            .expect_err("503 should fail");
        assert_eq!(error.api_error_code(), Some(503));
    }
    wait_for_served_count(&server, 2).await;
    assert_eq!(sender.breaker_state(), BreakerState::Open);

    let error = sender
        .send_message(&cancel, &request)
        .await
        .expect_err("open breaker should reject");
    match error.last_attempt_error() {
        Error::CircuitOpen { state, .. } => assert_eq!(*state, BreakerState::Open),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.served_count(), 2);
    assert_eq!(sender.metrics_snapshot().circuit_rejections, 1);
    assert_eq!(
        recorder.transitions(),
        vec![(BreakerState::Closed, BreakerState::Open)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_breaker_rejections_consume_the_retry_budget() {
    let server = CountingServer::start(unavailable());
    let recorder = Arc::new(RetryRecorder::default());
    let sender = Sender::builder(
        breaker_config(&server.base_url)
            .max_retries(2)
            .breaker_timeout(Duration::from_secs(30))
            .retry_backoff(Duration::from_millis(10), Duration::from_millis(20), 2.0),
    )
    .observer(Arc::clone(&recorder) as Arc<dyn Observer>)
    .build()
    .expect("sender should build");
    let cancel = CancellationToken::new();
    let request = SendMessageRequest::new(42, "hi");

    // Two 503s trip the breaker; the third attempt is already rejected.
    let _ = sender.send_message(&cancel, &request).await;
    assert_eq!(sender.breaker_state(), BreakerState::Open);
    assert_eq!(server.served_count(), 2);
    let rejections_before = sender.metrics_snapshot().circuit_rejections;
    let retries_before = recorder.retries().len();

    let error = sender
        .send_message(&cancel, &request)
        .await
        .expect_err("open breaker should reject every attempt");

    match &error {
        Error::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    match error.last_attempt_error() {
        Error::CircuitOpen { state, .. } => assert_eq!(*state, BreakerState::Open),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.served_count(), 2);
    assert_eq!(sender.metrics_snapshot().circuit_rejections - rejections_before, 3);

    let retries = recorder.retries();
    let new_retries = &retries[retries_before..];
    assert_eq!(new_retries.len(), 2);
    assert!(new_retries.iter().all(|event| {
        event.wait_source == WaitSource::Computed && event.error_code == ErrorCode::CircuitOpen
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn breaker_recovers_through_half_open_probe() {
    let server = CountingServer::start(unavailable());
    let recorder = Arc::new(TransitionRecorder::default());
    let sender = Sender::builder(breaker_config(&server.base_url))
        .observer(Arc::clone(&recorder) as Arc<dyn Observer>)
        .build()
        .expect("sender should build");
    let cancel = CancellationToken::new();
    let request = SendMessageRequest::new(42, "hi");

    for _ in 0..2 {
        let _ = sender.send_message(&cancel, &request).await;
    }
    assert_eq!(sender.breaker_state(), BreakerState::Open);

    server.respond_with(sent());
    tokio::time::sleep(Duration::from_millis(300)).await;

    sender
        .send_message(&cancel, &request)
        .await
        .expect("half-open probe should succeed");

    assert_eq!(sender.breaker_state(), BreakerState::Closed);
    assert_eq!(server.served_count(), 3);
    assert_eq!(
        recorder.transitions(),
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_errors_do_not_trip_breaker() {
    let server = CountingServer::start(ResponseSpec::new(
        400,
        json!({ "ok": false, "error_code": 400, "description": "Bad Request: chat not found" }),
        Duration::ZERO,
    ));
    let sender = Sender::new(breaker_config(&server.base_url)).expect("sender should build");
    let cancel = CancellationToken::new();

    for _ in 0..4 {
        let error = sender
            .send_message(&cancel, &SendMessageRequest::new(42, "hi"))
            .await
            .expect_err("400 should fail");
        assert_eq!(error.api_error_code(), Some(400));
    }

    assert_eq!(sender.breaker_state(), BreakerState::Closed);
    assert_eq!(server.served_count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_deadline_bounds_slow_exchange() {
    let mut slow = sent();
    slow.delay = Duration::from_millis(800);
    let server = CountingServer::start(slow);
    let sender = Sender::new(
        SenderConfig::new(TOKEN)
            .base_url(&server.base_url)
            .request_timeout(Duration::from_secs(5)),
    )
    .expect("sender should build");

    let started = Instant::now();
    let error = sender
        .send_message_within(Duration::from_millis(150), &SendMessageRequest::new(42, "hi"))
        .await
        .expect_err("deadline should expire first");

    assert!(started.elapsed() < Duration::from_millis(700));
    assert!(error.is_cancellation());
    match error {
        Error::DeadlineExceeded { timeout_ms, .. } => assert_eq!(timeout_ms, 150),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sender.metrics_snapshot().in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_spaces_consecutive_sends() {
    let server = CountingServer::start(sent());
    let sender = Sender::new(
        SenderConfig::new(TOKEN)
            .base_url(&server.base_url)
            .rate_limit(5.0, 1),
    )
    .expect("sender should build");
    let cancel = CancellationToken::new();
    let request = SendMessageRequest::new(42, "hi");

    let started = Instant::now();
    for _ in 0..3 {
        sender
            .send_message(&cancel, &request)
            .await
            .expect("send should succeed");
    }

    assert!(started.elapsed() >= Duration::from_millis(350));
    assert_eq!(server.served_count(), 3);
    assert_eq!(sender.metrics_snapshot().rate_limit_waits, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_while_waiting_for_token_reports_rate_limit() {
    let server = CountingServer::start(sent());
    let sender = Sender::new(
        SenderConfig::new(TOKEN)
            .base_url(&server.base_url)
            .rate_limit(0.5, 1),
    )
    .expect("sender should build");
    let request = SendMessageRequest::new(42, "hi");

    sender
        .send_message(&CancellationToken::new(), &request)
        .await
        .expect("first send uses the burst token");

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };
    let error = sender
        .send_message(&cancel, &request)
        .await
        .expect_err("second send waits two seconds for a token");
    canceller.await.expect("canceller should join");

    assert!(matches!(error, Error::RateLimitCancelled { .. }));
    assert!(error.is_cancellation());
    assert_eq!(server.served_count(), 1);
}
