//! Control plane client
//!
//! One function per Cloud Foundry API call. Every call is a single round trip
//! with no retry, bounded by the client timeout and by the caller's deadline.

use crate::error::GateError;
use crate::lifecycle::LifecycleState;
use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// OAuth client the cf CLI registers with UAA
const CF_CLIENT_ID: &str = "cf";

/// Environment variable stamped on every woken app
pub const LAST_REQUEST_TIME_VAR: &str = "LAST_REQUEST_TIME";

/// Failure of a single control plane call
#[derive(Debug, Error)]
pub enum CallError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request to {url} exceeded its deadline")]
    DeadlineExceeded { url: String },
}

/// Endpoints advertised by `GET /v2/info`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoveryInfo {
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub osbapi_version: String,
    #[serde(default)]
    pub app_ssh_endpoint: String,
    #[serde(default)]
    pub app_ssh_host_key_fingerprint: String,
    #[serde(default)]
    pub app_ssh_oauth_client: String,
    #[serde(default)]
    pub doppler_logging_endpoint: String,
    #[serde(default)]
    pub routing_endpoint: String,
}

/// Token endpoint answer to a password grant
#[derive(Clone, Default, Deserialize)]
pub struct SessionToken {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub jti: String,
}

impl SessionToken {
    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("jti", &self.jti)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub total_pages: u64,
}

impl Pagination {
    /// More results exist than the first page carries
    pub fn is_truncated(&self) -> bool {
        self.total_pages > 1
    }
}

/// Paged list answer of the v3 API
#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct ListResponse<T> {
    #[serde(default)]
    pagination: Pagination,
    #[serde(default = "Vec::new")]
    resources: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceDescriptor {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationDescriptor {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: Option<LifecycleState>,
}

/// Answer of `POST /v3/apps/{guid}/actions/start`
#[derive(Debug, Clone, Deserialize)]
pub struct StartOutcome {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub name: String,
    pub state: LifecycleState,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Thin wrapper around a `reqwest::Client` speaking the Cloud Foundry API
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
}

impl ControlPlaneClient {
    /// Create a client whose calls give up after `call_timeout`
    pub fn new(call_timeout: Duration) -> Result<Self, GateError> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GateError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http })
    }

    /// `GET {base}/v2/info`
    pub async fn fetch_discovery_info(
        &self,
        base_url: &str,
        deadline: Instant,
    ) -> Result<DiscoveryInfo, GateError> {
        let url = format!("{}/v2/info", base_url);
        let request = self.http.get(&url);
        call_json(&url, deadline, request.send())
            .await
            .map_err(GateError::Discovery)
    }

    /// Password grant against `{auth}/oauth/token`
    pub async fn exchange_credentials(
        &self,
        auth_endpoint: &str,
        username: &str,
        password: &str,
        deadline: Instant,
    ) -> Result<SessionToken, GateError> {
        let url = format!("{}/oauth/token", auth_endpoint.trim_end_matches('/'));
        let request = self
            .http
            .post(&url)
            .header(AUTHORIZATION, client_basic_auth())
            .form(&token_form(username, password));

        let token: SessionToken = call_json(&url, deadline, request.send())
            .await
            .map_err(GateError::Auth)?;

        if token.access_token.is_empty() {
            return Err(GateError::MissingAccessToken);
        }

        debug!(
            token_type = %token.token_type,
            expires_in = token.expires_in,
            "Obtained control plane token"
        );
        Ok(token)
    }

    /// `GET /v3/spaces?names={name}`
    pub async fn list_spaces(
        &self,
        base_url: &str,
        token: &SessionToken,
        space_name: &str,
        deadline: Instant,
    ) -> Result<Vec<SpaceDescriptor>, GateError> {
        let url = format!("{}/v3/spaces", base_url);
        let request = self
            .http
            .get(&url)
            .header(AUTHORIZATION, token.bearer())
            .query(&[("names", space_name)]);

        let list: ListResponse<SpaceDescriptor> = call_json(&url, deadline, request.send())
            .await
            .map_err(GateError::SpaceLookup)?;

        if list.pagination.is_truncated() {
            warn!(
                space = space_name,
                total_pages = list.pagination.total_pages,
                "Space listing spans several pages, only the first is used"
            );
        }
        debug!(
            space = space_name,
            total_results = list.pagination.total_results,
            total_pages = list.pagination.total_pages,
            "Listed spaces"
        );
        Ok(list.resources)
    }

    /// `GET /v3/apps?names={filter}&space_guids={guid}`
    pub async fn list_applications(
        &self,
        base_url: &str,
        token: &SessionToken,
        space_guid: &str,
        name_filter: &str,
        deadline: Instant,
    ) -> Result<Vec<ApplicationDescriptor>, GateError> {
        let url = format!("{}/v3/apps", base_url);
        let request = self
            .http
            .get(&url)
            .header(AUTHORIZATION, token.bearer())
            .query(&[("names", name_filter), ("space_guids", space_guid)]);

        let list: ListResponse<ApplicationDescriptor> = call_json(&url, deadline, request.send())
            .await
            .map_err(GateError::AppLookup)?;

        if list.pagination.is_truncated() {
            warn!(
                space_guid,
                filter = name_filter,
                total_pages = list.pagination.total_pages,
                "Application listing spans several pages, only the first is used"
            );
        }
        debug!(
            space_guid,
            filter = name_filter,
            total_results = list.pagination.total_results,
            total_pages = list.pagination.total_pages,
            "Listed applications"
        );
        Ok(list.resources)
    }

    /// `POST /v3/apps/{guid}/actions/start`
    pub async fn start_application(
        &self,
        base_url: &str,
        token: &SessionToken,
        app_guid: &str,
        deadline: Instant,
    ) -> Result<StartOutcome, GateError> {
        let url = format!(
            "{}/v3/apps/{}/actions/start",
            base_url,
            urlencoding::encode(app_guid)
        );
        let request = self.http.post(&url).header(AUTHORIZATION, token.bearer());

        call_json(&url, deadline, request.send())
            .await
            .map_err(|source| GateError::Start {
                app_guid: app_guid.to_string(),
                source,
            })
    }

    /// `PATCH /v3/apps/{guid}/environment_variables` setting LAST_REQUEST_TIME
    pub async fn touch_application(
        &self,
        base_url: &str,
        token: &SessionToken,
        app_guid: &str,
        timestamp: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<bool, GateError> {
        let url = format!(
            "{}/v3/apps/{}/environment_variables",
            base_url,
            urlencoding::encode(app_guid)
        );
        let request = self
            .http
            .patch(&url)
            .header(AUTHORIZATION, token.bearer())
            .header(CONTENT_TYPE, "application/json")
            .body(last_request_body(timestamp));

        let to_touch_error = |source| GateError::Touch {
            app_guid: app_guid.to_string(),
            source,
        };

        let response = send(&url, deadline, request.send())
            .await
            .map_err(to_touch_error)?;

        if !response.status().is_success() {
            return Err(to_touch_error(CallError::Status {
                url,
                status: response.status().as_u16(),
            }));
        }

        Ok(true)
    }
}

/// `Basic base64("cf:")`, the public cf CLI client with an empty secret
fn client_basic_auth() -> String {
    format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{}:", CF_CLIENT_ID))
    )
}

fn token_form<'a>(username: &'a str, password: &'a str) -> [(&'static str, &'a str); 5] {
    [
        ("username", username),
        ("password", password),
        ("client_id", CF_CLIENT_ID),
        ("grant_type", "password"),
        ("response_type", "token"),
    ]
}

fn last_request_body(timestamp: DateTime<Utc>) -> String {
    serde_json::json!({
        "var": {
            LAST_REQUEST_TIME_VAR: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        }
    })
    .to_string()
}

async fn send<F>(url: &str, deadline: Instant, request: F) -> Result<reqwest::Response, CallError>
where
    F: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    match tokio::time::timeout_at(deadline, request).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(source)) if source.is_timeout() => Err(CallError::DeadlineExceeded {
            url: url.to_string(),
        }),
        Ok(Err(source)) => Err(CallError::Transport {
            url: url.to_string(),
            source,
        }),
        Err(_) => Err(CallError::DeadlineExceeded {
            url: url.to_string(),
        }),
    }
}

/// Send, require a 2xx status and decode the JSON body
async fn call_json<T, F>(url: &str, deadline: Instant, request: F) -> Result<T, CallError>
where
    T: DeserializeOwned,
    F: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let response = send(url, deadline, request).await?;

    let status = response.status();
    if !status.is_success() {
        return Err(CallError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = match tokio::time::timeout_at(deadline, response.bytes()).await {
        Ok(Ok(body)) => body,
        Ok(Err(source)) => {
            return Err(CallError::Transport {
                url: url.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(CallError::DeadlineExceeded {
                url: url.to_string(),
            })
        }
    };

    serde_json::from_slice(&body).map_err(|source| CallError::Decode {
        url: url.to_string(),
        source,
    })
}
