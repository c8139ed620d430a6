//! Pooled forwarding to the upstream behind the gate
//!
//! Requests that pass the gate go out unmodified apart from the URI, which is
//! rewritten to the configured upstream scheme and authority.

use crate::config::UpstreamConfig;
use crate::error::GateBody;
use http::uri::{Authority, Scheme};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream forwarding
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "Client error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

/// Connection pool to the single upstream
pub struct Upstream {
    client: Client<HttpConnector, Incoming>,
    scheme: Scheme,
    authority: Authority,
    request_timeout: Duration,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let uri: Uri = config.url.parse()?;
        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("upstream url '{}' has no host", config.url))?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout())
            .build(connector);

        debug!(
            upstream = %authority,
            max_idle = config.pool_max_idle_per_host,
            idle_timeout_secs = config.pool_idle_timeout_secs,
            "Upstream pool initialized"
        );

        Ok(Self {
            client,
            scheme,
            authority,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Rewrite the request target to the upstream and send it through the pool
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<GateBody>, UpstreamError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.upstream_uri(&parts.uri)?;

        let response = self.client.request(Request::from_parts(parts, body)).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    fn upstream_uri(&self, original: &Uri) -> Result<Uri, UpstreamError> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))
    }
}
