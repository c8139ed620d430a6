//! Error taxonomy and JSON error responses for the gate

use crate::client::CallError;
use crate::gate::GateStage;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Body type of every response the gate produces or forwards
pub type GateBody = BoxBody<Bytes, hyper::Error>;

/// Header carrying the error code on gate-generated error responses
pub const X_GATE_ERROR: &str = "x-gate-error";

/// Error codes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateErrorCode {
    /// A required setting is missing or invalid
    ConfigError,
    /// Network failure, deadline or non-2xx answer from the control plane
    TransportError,
    /// Control plane answered with a body that could not be parsed
    DecodeError,
    /// Credential exchange failed
    AuthError,
    /// Space or application lookup returned no usable result
    ResolutionError,
    /// Start or touch action failed
    LifecycleError,
    /// Start action reported a lifecycle state the gate does not act on
    UnexpectedState,
    /// Forwarding to the upstream failed
    UpstreamUnavailable,
    /// Upstream did not answer in time
    UpstreamTimeout,
}

impl GateErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GateErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GateErrorCode::ConfigError
            | GateErrorCode::TransportError
            | GateErrorCode::DecodeError
            | GateErrorCode::AuthError
            | GateErrorCode::ResolutionError
            | GateErrorCode::LifecycleError
            | GateErrorCode::UnexpectedState => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::ConfigError => "CONFIG_ERROR",
            GateErrorCode::TransportError => "TRANSPORT_ERROR",
            GateErrorCode::DecodeError => "DECODE_ERROR",
            GateErrorCode::AuthError => "AUTH_ERROR",
            GateErrorCode::ResolutionError => "RESOLUTION_ERROR",
            GateErrorCode::LifecycleError => "LIFECYCLE_ERROR",
            GateErrorCode::UnexpectedState => "UNEXPECTED_STATE",
            GateErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GateErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

/// Failures of the construction step or of the per-request chain
#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("discovery call failed: {0}")]
    Discovery(#[source] CallError),

    #[error("credential exchange failed: {0}")]
    Auth(#[source] CallError),

    #[error("token endpoint returned no access token")]
    MissingAccessToken,

    #[error("space lookup failed: {0}")]
    SpaceLookup(#[source] CallError),

    #[error("no space named '{space}'")]
    SpaceNotFound { space: String },

    #[error("application lookup failed: {0}")]
    AppLookup(#[source] CallError),

    #[error("no application matches '{filter}' in space {space_guid}")]
    NoMatchingApps { filter: String, space_guid: String },

    #[error("starting app {app_guid} failed: {source}")]
    Start {
        app_guid: String,
        #[source]
        source: CallError,
    },

    #[error("recording last request time on app {app_guid} failed: {source}")]
    Touch {
        app_guid: String,
        #[source]
        source: CallError,
    },
}

impl GateError {
    /// Taxonomy code reported to callers
    pub fn code(&self) -> GateErrorCode {
        match self {
            GateError::Config(_) => GateErrorCode::ConfigError,
            GateError::Discovery(CallError::Decode { .. }) => GateErrorCode::DecodeError,
            GateError::Discovery(_) => GateErrorCode::TransportError,
            GateError::Auth(_) | GateError::MissingAccessToken => GateErrorCode::AuthError,
            GateError::SpaceLookup(_)
            | GateError::SpaceNotFound { .. }
            | GateError::AppLookup(_)
            | GateError::NoMatchingApps { .. } => GateErrorCode::ResolutionError,
            GateError::Start { .. } | GateError::Touch { .. } => GateErrorCode::LifecycleError,
        }
    }

    /// Message safe to hand to the inbound caller. Details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            GateError::Config(_) => "Gate is misconfigured",
            GateError::Discovery(_) => "Error while getting control plane info",
            GateError::Auth(_) | GateError::MissingAccessToken => "Error in getting token",
            GateError::SpaceLookup(_) | GateError::SpaceNotFound { .. } => {
                "Error in getting space guid"
            }
            GateError::AppLookup(_) | GateError::NoMatchingApps { .. } => {
                "Error in getting app guid"
            }
            GateError::Start { .. } => "Error in starting app using guids",
            GateError::Touch { .. } => "Error in recording last request time",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GateErrorCode,
    /// Stage of the gate chain that failed, if the failure came from the chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<GateStage>,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GateErrorCode, stage: Option<GateStage>, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            stage,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gate-Error header
pub fn json_error_response(
    code: GateErrorCode,
    stage: Option<GateStage>,
    message: impl Into<String>,
) -> Response<GateBody> {
    let body = ErrorResponse::new(code, stage, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_GATE_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Wrap bytes into the boxed body type
pub fn full_body(body: impl Into<Bytes>) -> GateBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}
