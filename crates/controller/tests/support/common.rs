#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request as HttpRequest, StatusCode, header::CONTENT_TYPE},
};
use devconf_controller::{
    app_state::AppState,
    backend::{BackendRegistry, DsaPolicy},
    checksum::ChecksumCache,
    config::{LimitsConfig, RegistrationConfig, VpnConfig},
    context::{ContextFunctions, ContextResolver},
    events::{EventBus, MemoryEventLog},
    http::{build_metrics_router, build_router},
    metrics::{init_metrics_recorder, record_build_info},
    persistence::{ContextVars, migrations},
    pki::{DH_PLACEHOLDER, RcgenIssuer, StaticDhGenerator},
    tasks::{RetryPolicy, TaskMode, TaskRunner},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

pub const ORG_SECRET: &str = "acme-secret";

#[derive(Clone)]
pub struct TestAppConfig {
    pub registration: RegistrationConfig,
    pub limits: LimitsConfig,
    pub global_context: ContextVars,
}

impl Default for TestAppConfig {
    fn default() -> Self {
        Self {
            registration: RegistrationConfig {
                enabled: true,
                consistent: true,
                self_creation: true,
            },
            limits: LimitsConfig::default(),
            global_context: ContextVars::new(),
        }
    }
}

pub struct TestApp {
    pub state: AppState,
    pub events: MemoryEventLog,
    pub app: Router,
    pub metrics_app: Router,
}

pub async fn setup_state_with_config(config: TestAppConfig) -> (AppState, MemoryEventLog) {
    let db = migrations::init_pool("sqlite::memory:").await.unwrap();
    let outcome = migrations::run_migrations(&db).await.unwrap();
    let metrics_handle = init_metrics_recorder();
    record_build_info(&outcome.snapshot);
    let events = MemoryEventLog::new();

    let state = AppState {
        db,
        registration: config.registration,
        vpn: VpnConfig::default(),
        limits: config.limits,
        backends: Arc::new(BackendRegistry::with_defaults(DsaPolicy::fallback_only(true)).unwrap()),
        context: Arc::new(ContextResolver::new(
            config.global_context,
            ContextFunctions::new(),
            false,
        )),
        checksums: ChecksumCache::new(Duration::from_secs(60)),
        events: EventBus::with_handler(Arc::new(events.clone())),
        cert_issuer: Arc::new(RcgenIssuer),
        dh_generator: Arc::new(StaticDhGenerator(DH_PLACEHOLDER.to_string())),
        tasks: TaskRunner::new(
            TaskMode::Inline,
            RetryPolicy {
                max_retries: 0,
                backoff: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
        ),
        metrics_handle,
    };
    (state, events)
}

pub async fn setup_app_with_config(config: TestAppConfig) -> TestApp {
    let (state, events) = setup_state_with_config(config).await;
    let app = build_router(state.clone()).with_state(state.clone());
    let metrics_app = build_metrics_router().with_state(state.clone());
    TestApp {
        state,
        events,
        app,
        metrics_app,
    }
}

pub async fn setup_app() -> TestApp {
    setup_app_with_config(TestAppConfig::default()).await
}

pub fn get(uri: &str) -> HttpRequest<Body> {
    HttpRequest::get(uri).body(Body::empty()).unwrap()
}

pub fn form_post(uri: &str, fields: &[(&str, &str)]) -> HttpRequest<Body> {
    let body = fields
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    HttpRequest::post(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

fn encode(raw: &str) -> String {
    raw.bytes()
        .map(|byte| match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (byte as char).to_string()
            }
            b' ' => "+".to_string(),
            other => format!("%{other:02X}"),
        })
        .collect()
}

pub async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

pub async fn send_text(app: &Router, request: HttpRequest<Body>) -> (StatusCode, String) {
    let (status, body) = send(app, request).await;
    (status, String::from_utf8(body).unwrap())
}

/// `key: value` lines of a controller response.
pub fn parse_lines(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| line.split_once(": "))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn field<'a>(lines: &'a [(String, String)], name: &str) -> &'a str {
    lines
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .unwrap_or_else(|| panic!("missing field {name}"))
}

pub struct Registered {
    pub uuid: String,
    pub key: String,
    pub is_new: bool,
}

pub async fn register(app: &Router, name: &str, mac_address: &str) -> Registered {
    let (status, body) = send_text(
        app,
        form_post(
            "/register/",
            &[
                ("secret", ORG_SECRET),
                ("name", name),
                ("mac_address", mac_address),
                ("backend", "netjson"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let lines = parse_lines(&body);
    Registered {
        uuid: field(&lines, "uuid").to_string(),
        key: field(&lines, "key").to_string(),
        is_new: field(&lines, "is-new") == "1",
    }
}

/// Unpack a downloaded configuration into `(path, contents)` pairs.
pub fn unpack(bytes: &[u8]) -> Vec<(String, String)> {
    use std::io::Read;

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            (path, contents)
        })
        .collect()
}
