use crate::error::{json_error_response, GateBody, GateErrorCode};
use crate::gate::Gate;
use crate::upstream::Upstream;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// HTTP listener that runs every request through the gate
pub struct GateServer {
    bind_addr: SocketAddr,
    gate: Arc<Gate>,
    upstream: Arc<Upstream>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GateServer {
    pub fn new(
        bind_addr: SocketAddr,
        gate: Arc<Gate>,
        upstream: Arc<Upstream>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gate,
            upstream,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            gate = %self.gate.config().name,
            upstream = %self.upstream.authority(),
            "Gate listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            let upstream = Arc::clone(&self.upstream);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gate, upstream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gate server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gate: Arc<Gate>,
    upstream: Arc<Upstream>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gate = Arc::clone(&gate);
        let upstream = Arc::clone(&upstream);
        async move { handle_request(req, gate, upstream, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gate: Arc<Gate>,
    upstream: Arc<Upstream>,
    client_addr: SocketAddr,
) -> Result<Response<GateBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(
        client = %client_addr,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Incoming request"
    );

    let response = gate
        .handle(req, |req| forward(req, upstream, &request_id))
        .await;

    debug!(request_id, status = %response.status(), "Request gated");
    Ok(response)
}

async fn forward(
    req: Request<Incoming>,
    upstream: Arc<Upstream>,
    request_id: &str,
) -> Response<GateBody> {
    let request_timeout = upstream.request_timeout();

    match tokio::time::timeout(request_timeout, upstream.send_request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(request_id, upstream = %upstream.authority(), error = %e, "Failed to forward request");
            json_error_response(
                GateErrorCode::UpstreamUnavailable,
                None,
                "Failed to connect to upstream",
            )
        }
        Err(_) => {
            warn!(
                request_id,
                upstream = %upstream.authority(),
                timeout_secs = request_timeout.as_secs(),
                "Upstream request timed out"
            );
            json_error_response(
                GateErrorCode::UpstreamTimeout,
                None,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            )
        }
    }
}
