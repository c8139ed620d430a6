//! Gating orchestrator
//!
//! For every inbound request the gate logs in to the control plane, resolves
//! the configured space and apps, starts them and then decides whether the
//! request may pass. Nothing is remembered between requests: the only state
//! a [`Gate`] holds is its configuration and the discovery info fetched once
//! at construction.

use crate::client::{ControlPlaneClient, DiscoveryInfo};
use crate::config::GateConfig;
use crate::error::{full_body, json_error_response, GateBody, GateError, GateErrorCode};
use crate::lifecycle::{self, LifecycleState};
use crate::resolver;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Body of the 202 answer while apps boot
pub const STARTING_MESSAGE: &str = "Service is starting...";

/// Steps of the per-request chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    Initial,
    Authenticating,
    ResolvingSpace,
    ResolvingApps,
    Starting,
    Decided,
    Error,
}

/// What the gate decided to do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Apps are up, hand the request to the downstream handler
    Forward,
    /// Apps are booting, the caller should come back later
    Retry { hint: &'static str },
    /// The chain failed or ended in a state the gate does not act on
    Fail {
        stage: GateStage,
        code: GateErrorCode,
        message: String,
    },
}

impl Disposition {
    /// Build the response for every disposition except `Forward`
    pub fn into_response(self) -> Option<Response<GateBody>> {
        match self {
            Disposition::Forward => None,
            Disposition::Retry { hint } => Some(
                Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(full_body(hint))
                    .expect("valid response builder"),
            ),
            Disposition::Fail {
                stage,
                code,
                message,
            } => Some(json_error_response(code, Some(stage), message)),
        }
    }
}

/// The on-demand gate for one set of applications
pub struct Gate {
    config: GateConfig,
    discovery: DiscoveryInfo,
    client: ControlPlaneClient,
}

impl Gate {
    /// Validate `config` and fetch the control plane discovery info.
    ///
    /// Fails fast on the first empty required setting and when discovery
    /// fails, so a gate that exists is always able to serve.
    pub async fn new(config: GateConfig) -> Result<Self, GateError> {
        config.validate()?;

        let client = ControlPlaneClient::new(config.call_timeout())?;
        let deadline = Instant::now() + config.chain_timeout();
        let discovery = client
            .fetch_discovery_info(config.api_base(), deadline)
            .await?;

        if discovery.authorization_endpoint.is_empty() {
            return Err(GateError::Config(format!(
                "{} did not advertise an authorization endpoint",
                config.api_base()
            )));
        }

        info!(
            gate = %config.name,
            api = %config.api_base(),
            authorization_endpoint = %discovery.authorization_endpoint,
            api_version = %discovery.api_version,
            "Control plane discovered"
        );

        Ok(Self {
            config,
            discovery,
            client,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoveryInfo {
        &self.discovery
    }

    /// Run the full chain once and map the outcome to a disposition
    pub async fn evaluate(&self) -> Disposition {
        let mut stage = GateStage::Initial;
        let deadline = Instant::now() + self.config.chain_timeout();

        let state = match self.run_chain(&mut stage, deadline).await {
            Ok(state) => state,
            Err(e) => {
                let failed_at = stage;
                enter(&mut stage, GateStage::Error);
                error!(gate = %self.config.name, stage = ?failed_at, error = %e, "Gate chain failed");
                return Disposition::Fail {
                    stage: failed_at,
                    code: e.code(),
                    message: e.public_message().to_string(),
                };
            }
        };

        match state {
            LifecycleState::Started => Disposition::Forward,
            LifecycleState::Starting => {
                info!(gate = %self.config.name, "Applications are starting, asking caller to retry");
                Disposition::Retry {
                    hint: STARTING_MESSAGE,
                }
            }
            LifecycleState::Unknown(raw) => {
                error!(gate = %self.config.name, state = %raw, "Unexpected application state");
                Disposition::Fail {
                    stage: GateStage::Decided,
                    code: GateErrorCode::UnexpectedState,
                    message: "Unexpected status answer from ondemand service".to_string(),
                }
            }
        }
    }

    async fn run_chain(
        &self,
        stage: &mut GateStage,
        deadline: Instant,
    ) -> Result<LifecycleState, GateError> {
        let config = &self.config;

        enter(stage, GateStage::Authenticating);
        let token = self
            .client
            .exchange_credentials(
                &self.discovery.authorization_endpoint,
                &config.username,
                config.password.expose(),
                deadline,
            )
            .await?;

        enter(stage, GateStage::ResolvingSpace);
        let space_guid = resolver::resolve_space(&self.client, config, &token, deadline).await?;

        enter(stage, GateStage::ResolvingApps);
        let apps =
            resolver::resolve_applications(&self.client, config, &token, &space_guid, deadline)
                .await?;
        if apps.is_empty() {
            return Err(GateError::NoMatchingApps {
                filter: config.apps.clone(),
                space_guid,
            });
        }

        enter(stage, GateStage::Starting);
        let outcomes = lifecycle::start_all(&self.client, config, &token, &apps, deadline).await?;
        if config.record_last_request {
            lifecycle::touch_all(&self.client, config, &token, &apps, chrono::Utc::now(), deadline)
                .await?;
        }

        enter(stage, GateStage::Decided);
        let state = config.start_policy.aggregate(&outcomes);
        debug!(
            policy = ?config.start_policy,
            apps = outcomes.len(),
            state = state.as_str(),
            "Start outcomes aggregated"
        );
        Ok(state)
    }

    /// Gate one request: forward it to `next` untouched when the apps are
    /// started, otherwise answer on the downstream handler's behalf.
    pub async fn handle<B, F, Fut>(&self, req: Request<B>, next: F) -> Response<GateBody>
    where
        F: FnOnce(Request<B>) -> Fut,
        Fut: Future<Output = Response<GateBody>>,
    {
        match self.evaluate().await.into_response() {
            None => next(req).await,
            Some(response) => response,
        }
    }
}

fn enter(stage: &mut GateStage, next: GateStage) {
    debug!(from = ?*stage, to = ?next, "Gate stage");
    *stage = next;
}
