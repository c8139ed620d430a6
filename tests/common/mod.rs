//! In-process mock of the Cloud Foundry control plane for integration tests

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use wakegate::config::{GateConfig, Secret};

pub const ACCESS_TOKEN: &str = "mock-access-token";

/// How the mock answers
#[derive(Clone)]
pub struct Behavior {
    /// GUIDs returned by the space lookup
    pub spaces: Vec<String>,
    /// GUIDs returned by the app lookup
    pub apps: Vec<String>,
    /// State returned by every start action unless overridden per app
    pub start_state: String,
    /// Per app GUID start state
    pub app_states: HashMap<String, String>,
    /// Authorization endpoint advertised by discovery; defaults to the mock itself
    pub authorization_endpoint: Option<String>,
    pub info_status: u16,
    /// Raw body for discovery instead of the generated info
    pub info_body: Option<String>,
    pub token_status: u16,
    pub access_token: String,
    pub start_status: u16,
    /// Raw body for the start action instead of the generated app
    pub start_body: Option<String>,
    pub touch_status: u16,
    /// Raw body for the space lookup instead of a generated list
    pub spaces_body: Option<String>,
    pub apps_status: u16,
    /// Raw body for the app lookup instead of a generated list
    pub apps_body: Option<String>,
    /// Delay before answering the start action
    pub start_delay: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            spaces: vec!["s1".to_string()],
            apps: vec!["a1".to_string()],
            start_state: "STARTED".to_string(),
            app_states: HashMap::new(),
            authorization_endpoint: None,
            info_status: 200,
            info_body: None,
            token_status: 200,
            access_token: ACCESS_TOKEN.to_string(),
            start_status: 200,
            start_body: None,
            touch_status: 200,
            spaces_body: None,
            apps_status: 200,
            apps_body: None,
            start_delay: None,
        }
    }
}

impl Behavior {
    pub fn with_start_state(state: &str) -> Self {
        Self {
            start_state: state.to_string(),
            ..Self::default()
        }
    }
}

/// A request as seen by the mock
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

pub struct MockControlPlane {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    handle: JoinHandle<()>,
}

impl MockControlPlane {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let behavior = Arc::new(behavior);
        let base_url = url.clone();
        let log = Arc::clone(&requests);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let behavior = Arc::clone(&behavior);
                let base_url = base_url.clone();
                let log = Arc::clone(&log);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        route(req, Arc::clone(&behavior), base_url.clone(), Arc::clone(&log))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            url,
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, method: Method, path_fragment: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path.contains(path_fragment))
            .collect()
    }

    /// Gate settings pointing at this mock
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            name: "wakegate-test".to_string(),
            api_endpoint: self.url.clone(),
            org_name: "DEFAULT_ORG".to_string(),
            space_name: "DEFAULT_SPACE".to_string(),
            apps: "TEST_APP".to_string(),
            username: "TEST_USER".to_string(),
            password: Secret::from("TEST_PASS"),
            call_timeout_secs: 5,
            chain_timeout_secs: 10,
            ..GateConfig::default()
        }
    }
}

impl Drop for MockControlPlane {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn json(status: u16, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn list(guids: &[String], name: &str) -> String {
    let resources: Vec<_> = guids
        .iter()
        .map(|guid| serde_json::json!({ "guid": guid, "name": name }))
        .collect();
    serde_json::json!({
        "pagination": { "total_results": resources.len(), "total_pages": 1 },
        "resources": resources,
    })
    .to_string()
}

async fn route(
    req: Request<Incoming>,
    behavior: Arc<Behavior>,
    base_url: String,
    log: Arc<Mutex<Vec<Recorded>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
        .unwrap_or_default();

    let query = parts
        .uri
        .query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| {
                    (
                        k.to_string(),
                        urlencoding::decode(v).unwrap_or_default().into_owned(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };

    let path = parts.uri.path().to_string();
    log.lock().push(Recorded {
        method: parts.method.clone(),
        path: path.clone(),
        query,
        authorization: header("authorization"),
        content_type: header("content-type"),
        body,
    });

    let response = match (&parts.method, path.as_str()) {
        (&Method::GET, "/v2/info") => json(
            behavior.info_status,
            behavior.info_body.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "authorization_endpoint": behavior.authorization_endpoint.clone().unwrap_or(base_url),
                    "token_endpoint": "http://uaa.invalid",
                    "api_version": "2.150.0",
                })
                .to_string()
            }),
        ),
        (&Method::POST, "/oauth/token") => json(
            behavior.token_status,
            serde_json::json!({
                "access_token": behavior.access_token,
                "token_type": "bearer",
                "expires_in": 599,
                "scope": "cloud_controller.read cloud_controller.write",
                "jti": "mock-jti",
            })
            .to_string(),
        ),
        (&Method::GET, "/v3/spaces") => json(
            200,
            behavior
                .spaces_body
                .clone()
                .unwrap_or_else(|| list(&behavior.spaces, "DEFAULT_SPACE")),
        ),
        (&Method::GET, "/v3/apps") => json(
            behavior.apps_status,
            behavior
                .apps_body
                .clone()
                .unwrap_or_else(|| list(&behavior.apps, "TEST_APP")),
        ),
        (&Method::POST, p) if p.starts_with("/v3/apps/") && p.ends_with("/actions/start") => {
            if let Some(delay) = behavior.start_delay {
                tokio::time::sleep(delay).await;
            }
            let guid = p
                .trim_start_matches("/v3/apps/")
                .trim_end_matches("/actions/start");
            let state = behavior
                .app_states
                .get(guid)
                .unwrap_or(&behavior.start_state);
            json(
                behavior.start_status,
                behavior.start_body.clone().unwrap_or_else(|| {
                    serde_json::json!({
                        "guid": guid,
                        "name": "TEST_APP",
                        "state": state,
                        "created_at": "2026-01-10T08:00:00Z",
                        "updated_at": "2026-01-11T09:15:00Z",
                    })
                    .to_string()
                }),
            )
        }
        (&Method::PATCH, p) if p.ends_with("/environment_variables") => json(
            behavior.touch_status,
            serde_json::json!({ "var": {} }).to_string(),
        ),
        _ => json(404, r#"{"errors":[{"title":"CF-NotFound"}]}"#.to_string()),
    };

    Ok(response)
}
