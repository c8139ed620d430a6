//! Resource resolver: configured names to control plane GUIDs

use crate::client::{ApplicationDescriptor, ControlPlaneClient, SessionToken};
use crate::config::GateConfig;
use crate::error::GateError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resolve the configured space name to its GUID.
///
/// Zero matches is an error. When the name matches several spaces (same name
/// in different orgs) the first one wins.
pub async fn resolve_space(
    client: &ControlPlaneClient,
    config: &GateConfig,
    token: &SessionToken,
    deadline: Instant,
) -> Result<String, GateError> {
    let spaces = client
        .list_spaces(config.api_base(), token, &config.space_name, deadline)
        .await?;

    let space = spaces.first().ok_or_else(|| GateError::SpaceNotFound {
        space: config.space_name.clone(),
    })?;

    if spaces.len() > 1 {
        warn!(
            space = %config.space_name,
            matches = spaces.len(),
            chosen = %space.guid,
            "Space name is ambiguous, using first match"
        );
    }

    debug!(space = %config.space_name, space_guid = %space.guid, "Space resolved");
    Ok(space.guid.clone())
}

/// Resolve the configured app filter inside a space. An empty result is not an error here.
pub async fn resolve_applications(
    client: &ControlPlaneClient,
    config: &GateConfig,
    token: &SessionToken,
    space_guid: &str,
    deadline: Instant,
) -> Result<Vec<ApplicationDescriptor>, GateError> {
    let apps = client
        .list_applications(config.api_base(), token, space_guid, &config.apps, deadline)
        .await?;

    for app in &apps {
        debug!(
            app = %app.name,
            app_guid = %app.guid,
            state = app.state.as_ref().map_or("", |s| s.as_str()),
            "Application resolved"
        );
    }
    debug!(filter = %config.apps, space_guid, matches = apps.len(), "Applications resolved");
    Ok(apps)
}
