//! Wakegate - A request gate that wakes scaled-to-zero Cloud Foundry apps
//!
//! For every inbound request the gate:
//! - Logs in to the Cloud Foundry control plane with a password grant
//! - Resolves the configured space and the apps matching the name filter
//! - Issues a start action for each app and stamps its LAST_REQUEST_TIME
//! - Forwards the request once the apps report STARTED, answers 202 while
//!   they are STARTING and 500 on any failure or unexpected state

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod resolver;
pub mod server;
pub mod upstream;
