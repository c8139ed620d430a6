//! Lifecycle controller: wakes applications and stamps their last request time

use crate::client::{ApplicationDescriptor, ControlPlaneClient, SessionToken, StartOutcome};
use crate::config::GateConfig;
use crate::error::GateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// Running status of an application as reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum LifecycleState {
    /// The app is up and can take traffic
    Started,
    /// The app is booting
    Starting,
    /// Anything else, with the raw value as reported
    Unknown(String),
}

impl LifecycleState {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("started") {
            LifecycleState::Started
        } else if raw.eq_ignore_ascii_case("starting") {
            LifecycleState::Starting
        } else {
            LifecycleState::Unknown(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LifecycleState::Started => "STARTED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Unknown(raw) => raw,
        }
    }
}

impl From<String> for LifecycleState {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

/// How the start outcomes of several matching apps reduce to one state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// Only the first app decides
    First,
    /// Every app must be started before traffic flows
    #[default]
    All,
    /// One started app is enough
    Any,
}

impl StartPolicy {
    pub fn aggregate(&self, outcomes: &[StartOutcome]) -> LifecycleState {
        let Some(first) = outcomes.first() else {
            return LifecycleState::Unknown(String::new());
        };

        match self {
            StartPolicy::First => first.state.clone(),
            StartPolicy::All => {
                if outcomes.iter().all(|o| o.state == LifecycleState::Started) {
                    LifecycleState::Started
                } else if outcomes.iter().all(|o| {
                    matches!(o.state, LifecycleState::Started | LifecycleState::Starting)
                }) {
                    LifecycleState::Starting
                } else {
                    first_unknown(outcomes)
                }
            }
            StartPolicy::Any => {
                if outcomes.iter().any(|o| o.state == LifecycleState::Started) {
                    LifecycleState::Started
                } else if outcomes.iter().any(|o| o.state == LifecycleState::Starting) {
                    LifecycleState::Starting
                } else {
                    first_unknown(outcomes)
                }
            }
        }
    }
}

fn first_unknown(outcomes: &[StartOutcome]) -> LifecycleState {
    outcomes
        .iter()
        .map(|o| &o.state)
        .find(|state| matches!(state, LifecycleState::Unknown(_)))
        .cloned()
        .unwrap_or_else(|| LifecycleState::Unknown(String::new()))
}

/// Issue a start action for every app in order, stopping at the first failure
pub async fn start_all(
    client: &ControlPlaneClient,
    config: &GateConfig,
    token: &SessionToken,
    apps: &[ApplicationDescriptor],
    deadline: Instant,
) -> Result<Vec<StartOutcome>, GateError> {
    let mut outcomes = Vec::with_capacity(apps.len());

    for app in apps {
        let outcome = client
            .start_application(config.api_base(), token, &app.guid, deadline)
            .await?;

        info!(
            app = %app.name,
            app_guid = %app.guid,
            state = outcome.state.as_str(),
            "Start action issued"
        );
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

/// Stamp LAST_REQUEST_TIME on every app in order, stopping at the first failure
pub async fn touch_all(
    client: &ControlPlaneClient,
    config: &GateConfig,
    token: &SessionToken,
    apps: &[ApplicationDescriptor],
    now: DateTime<Utc>,
    deadline: Instant,
) -> Result<(), GateError> {
    for app in apps {
        client
            .touch_application(config.api_base(), token, &app.guid, now, deadline)
            .await?;
        debug!(app_guid = %app.guid, last_request_time = %now, "Last request time recorded");
    }

    Ok(())
}
