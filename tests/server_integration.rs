//! End-to-end tests: HTTP client -> GateServer -> upstream, with a mock control plane

mod common;

use common::{Behavior, MockControlPlane};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use wakegate::config::UpstreamConfig;
use wakegate::gate::Gate;
use wakegate::server::GateServer;
use wakegate::upstream::Upstream;

/// Pick a port nothing listens on
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a port to accept connections
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and get response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nX-Request-Id: it-{}\r\nConnection: close\r\n\r\n",
        path, port, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Upstream stub that echoes the request target
struct StubUpstream {
    port: u16,
    seen: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl StubUpstream {
    async fn start(delay: Option<Duration>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let log = Arc::clone(&log);
                        async move {
                            let target = req
                                .uri()
                                .path_and_query()
                                .map(|pq| pq.to_string())
                                .unwrap_or_default();
                            log.lock().push(target.clone());
                            if let Some(delay) = delay {
                                tokio::time::sleep(delay).await;
                            }
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(format!(
                                "upstream saw {}",
                                target
                            )))))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { port, seen, handle }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct RunningGate {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_gate(mock: &MockControlPlane, upstream_port: u16, timeout_secs: u64) -> RunningGate {
    let gate = Gate::new(mock.gate_config()).await.unwrap();
    let upstream = Upstream::new(&UpstreamConfig {
        url: format!("http://127.0.0.1:{}", upstream_port),
        request_timeout_secs: timeout_secs,
        ..UpstreamConfig::default()
    })
    .unwrap();

    let port = free_port();
    let bind_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = GateServer::new(bind_addr, Arc::new(gate), Arc::new(upstream), shutdown_rx);
    let handle = tokio::spawn(server.run());

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "gate did not start listening"
    );

    RunningGate {
        port,
        shutdown_tx,
        handle,
    }
}

#[tokio::test]
async fn test_started_app_reaches_upstream() {
    let mock = MockControlPlane::start(Behavior::with_start_state("STARTED")).await;
    let upstream = StubUpstream::start(None).await;
    let gate = start_gate(&mock, upstream.port, 10).await;

    let response = http_get(gate.port, "/reports/daily?format=csv").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("upstream saw /reports/daily?format=csv"));
    assert_eq!(upstream.seen(), vec!["/reports/daily?format=csv".to_string()]);

    let _ = gate.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_starting_app_gets_accepted_without_upstream() {
    let mock = MockControlPlane::start(Behavior::with_start_state("STARTING")).await;
    let upstream = StubUpstream::start(None).await;
    let gate = start_gate(&mock, upstream.port, 10).await;

    let response = http_get(gate.port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 202"), "got: {}", response);
    assert!(response.contains("Service is starting..."));
    assert!(upstream.seen().is_empty());

    let _ = gate.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_chain_failure_returns_json_error() {
    let mock = MockControlPlane::start(Behavior {
        token_status: 401,
        ..Behavior::default()
    })
    .await;
    let upstream = StubUpstream::start(None).await;
    let gate = start_gate(&mock, upstream.port, 10).await;

    let response = http_get(gate.port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"), "got: {}", response);
    assert!(response.to_lowercase().contains("x-gate-error: auth_error"));
    assert!(response.contains("\"code\":\"AUTH_ERROR\""));
    assert!(upstream.seen().is_empty());

    let _ = gate.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_upstream_down_returns_bad_gateway() {
    let mock = MockControlPlane::start(Behavior::default()).await;
    let gate = start_gate(&mock, free_port(), 10).await;

    let response = http_get(gate.port, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    assert!(response.contains("UPSTREAM_UNAVAILABLE"));

    let _ = gate.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_slow_upstream_returns_gateway_timeout() {
    let mock = MockControlPlane::start(Behavior::default()).await;
    let upstream = StubUpstream::start(Some(Duration::from_secs(5))).await;
    let gate = start_gate(&mock, upstream.port, 1).await;

    let response = http_get(gate.port, "/slow").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 504"), "got: {}", response);
    assert!(response.contains("UPSTREAM_TIMEOUT"));

    let _ = gate.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_server_stops_on_shutdown_signal() {
    let mock = MockControlPlane::start(Behavior::default()).await;
    let upstream = StubUpstream::start(None).await;
    let gate = start_gate(&mock, upstream.port, 10).await;

    gate.shutdown_tx.send(true).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), gate.handle).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));
}
