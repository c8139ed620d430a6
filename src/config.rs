use crate::error::GateError;
use crate::lifecycle::StartPolicy;
use hyper::Uri;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Public Cloud Foundry API used when no endpoint is configured
pub const DEFAULT_API_ENDPOINT: &str = "https://api.run.pivotal.io";

/// Global configuration for the gate binary
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Control plane settings of the gate
    #[serde(default)]
    pub gate: GateConfig,

    /// Where forwarded requests go
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

/// A credential that never shows up in `Debug` output
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Control plane settings of one gate instance.
///
/// Every name field defaults to empty so that a missing key reaches
/// [`GateConfig::validate`] and produces a descriptive error instead of a
/// parse failure.
#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    /// Instance name of the gate
    #[serde(default)]
    pub name: String,

    /// Control plane base URL
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Organization that owns the space. Required, but only logged: the
    /// space lookup filters by name alone and is not scoped to this org.
    #[serde(default)]
    pub org_name: String,

    /// Space the applications live in
    #[serde(default)]
    pub space_name: String,

    /// Application name filter, comma separated
    #[serde(default)]
    pub apps: String,

    /// Control plane user
    #[serde(default)]
    pub username: String,

    /// Control plane password
    #[serde(default)]
    pub password: Secret,

    /// Timeout of a single control plane call in seconds (default: 10)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Deadline for the whole authenticate, resolve, start chain in seconds (default: 30)
    #[serde(default = "default_chain_timeout")]
    pub chain_timeout_secs: u64,

    /// How start outcomes of several matching apps are combined (default: all)
    #[serde(default)]
    pub start_policy: StartPolicy,

    /// Stamp LAST_REQUEST_TIME on every started app (default: true)
    #[serde(default = "default_record_last_request")]
    pub record_last_request: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            api_endpoint: default_api_endpoint(),
            org_name: String::new(),
            space_name: String::new(),
            apps: String::new(),
            username: String::new(),
            password: Secret::default(),
            call_timeout_secs: default_call_timeout(),
            chain_timeout_secs: default_chain_timeout(),
            start_policy: StartPolicy::default(),
            record_last_request: default_record_last_request(),
        }
    }
}

impl GateConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn chain_timeout(&self) -> Duration {
        Duration::from_secs(self.chain_timeout_secs)
    }

    /// Control plane base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.api_endpoint.trim_end_matches('/')
    }

    /// Required settings that are empty, in the order they are checked
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("api_endpoint", &self.api_endpoint),
            ("org_name", &self.org_name),
            ("space_name", &self.space_name),
            ("apps", &self.apps),
            ("name", &self.name),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(field, _)| field)
        .collect()
    }

    /// Timeout settings that are zero
    pub fn zero_timeouts(&self) -> Vec<&'static str> {
        [
            ("call_timeout_secs", self.call_timeout_secs),
            ("chain_timeout_secs", self.chain_timeout_secs),
        ]
        .into_iter()
        .filter(|(_, secs)| *secs == 0)
        .map(|(field, _)| field)
        .collect()
    }

    /// Check the settings a gate cannot run without, stopping at the first gap
    pub fn validate(&self) -> Result<(), GateError> {
        if let Some(field) = self.missing_fields().first() {
            return Err(GateError::Config(format!("{} cannot be empty", field)));
        }
        if let Some(field) = self.zero_timeouts().first() {
            return Err(GateError::Config(format!("{} must be greater than 0", field)));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Request timeout in seconds (max time to wait for the upstream to respond)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections kept to the upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    /// Validate the upstream configuration
    pub fn validate(&self) -> Result<(), String> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| format!("upstream url '{}' is invalid: {}", self.url, e))?;

        if uri.scheme_str() != Some("http") {
            return Err(format!("upstream url '{}' must use http", self.url));
        }

        if uri.authority().is_none() {
            return Err(format!("upstream url '{}' has no host", self.url));
        }

        if self.request_timeout_secs == 0 {
            return Err("upstream request_timeout_secs must be greater than 0".to_string());
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

fn default_call_timeout() -> u64 {
    10
}

fn default_chain_timeout() -> u64 {
    30
}

fn default_record_last_request() -> bool {
    true
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let gate = &self.gate;
        for field in gate.missing_fields() {
            errors.push(format!("gate.{} cannot be empty", field));
        }

        for field in gate.zero_timeouts() {
            errors.push(format!("gate.{} must be greater than 0", field));
        }

        if let Err(e) = self.upstream.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
