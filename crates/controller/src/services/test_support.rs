use std::sync::Arc;
use std::time::Duration;

use common::api::{TemplateType, VpnBackend};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::backend::{BackendRegistry, DsaPolicy};
use crate::checksum::ChecksumCache;
use crate::config::{LimitsConfig, RegistrationConfig, VpnConfig};
use crate::context::{ContextFunctions, ContextResolver};
use crate::events::{EventBus, MemoryEventLog};
use crate::persistence::{
    ContextVars, DeviceRecord, OrganizationRecord, TemplateRecord, VpnRecord, configs,
};
use crate::pki::{DH_PLACEHOLDER, RcgenIssuer, StaticDhGenerator};
use crate::services::templates::TemplateInput;
use crate::tasks::{RetryPolicy, TaskMode, TaskRunner};

pub(crate) async fn setup_state() -> AppState {
    let db = crate::persistence::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    let migration_outcome = crate::persistence::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    let metrics_handle = crate::metrics::init_metrics_recorder();
    crate::metrics::record_build_info(&migration_outcome.snapshot);

    AppState {
        db,
        registration: RegistrationConfig {
            enabled: true,
            consistent: true,
            self_creation: true,
        },
        vpn: VpnConfig::default(),
        limits: LimitsConfig::default(),
        backends: Arc::new(
            BackendRegistry::with_defaults(DsaPolicy::fallback_only(true)).expect("backends"),
        ),
        context: Arc::new(ContextResolver::new(
            ContextVars::new(),
            ContextFunctions::new(),
            false,
        )),
        checksums: ChecksumCache::new(Duration::from_secs(60)),
        events: EventBus::new(),
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
    }
}

/// State whose event bus records every dispatched event.
pub(crate) async fn setup_state_with_events() -> (AppState, MemoryEventLog) {
    let mut state = setup_state().await;
    let log = MemoryEventLog::new();
    state.events = EventBus::with_handler(Arc::new(log.clone()));
    (state, log)
}

pub(crate) async fn organization(state: &AppState, name: &str) -> OrganizationRecord {
    crate::services::organizations::create_organization(state, name, Some(&format!("{name}-secret")))
        .await
        .expect("organization")
}

pub(crate) async fn device(
    state: &AppState,
    organization_id: Uuid,
    name: &str,
    mac_address: &str,
) -> DeviceRecord {
    let input = crate::services::devices::DeviceInput::new(organization_id, name, mac_address, "netjson");
    crate::services::devices::create_device(state, input)
        .await
        .expect("device")
        .0
}

pub(crate) async fn config_id(state: &AppState, device_id: Uuid) -> Uuid {
    configs::get_config_for_device(&state.db, device_id)
        .await
        .expect("db")
        .expect("config")
        .id
}

pub(crate) async fn template(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    config: Value,
) -> TemplateRecord {
    crate::services::templates::create_template(
        state,
        TemplateInput::generic(organization_id, name, "netjson", config),
    )
    .await
    .expect("template")
}

pub(crate) async fn default_template(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    config: Value,
    required: bool,
) -> TemplateRecord {
    let mut input = TemplateInput::generic(organization_id, name, "netjson", config);
    input.is_default = true;
    input.required = required;
    crate::services::templates::create_template(state, input)
        .await
        .expect("template")
}

pub(crate) async fn tagged_template(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    tags: &[&str],
) -> TemplateRecord {
    let mut input = TemplateInput::generic(
        organization_id,
        name,
        "netjson",
        json!({"general": {"description": name}}),
    );
    input.tags = tags.iter().map(|tag| tag.to_string()).collect();
    crate::services::templates::create_template(state, input)
        .await
        .expect("template")
}

pub(crate) async fn vpn_template(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    vpn_id: Uuid,
    auto_cert: bool,
) -> TemplateRecord {
    let mut input = TemplateInput::generic(organization_id, name, "netjson", json!({}));
    input.template_type = TemplateType::Vpn;
    input.vpn_id = Some(vpn_id);
    input.auto_cert = auto_cert;
    crate::services::templates::create_template(state, input)
        .await
        .expect("vpn template")
}

fn openvpn_input(organization_id: Option<Uuid>, name: &str, ca_id: Option<Uuid>) -> crate::services::vpn::VpnInput {
    crate::services::vpn::VpnInput {
        organization_id,
        name: name.into(),
        host: format!("{name}.vpn.example.com"),
        backend: VpnBackend::OpenVpn,
        ca_id,
        cert_id: None,
        dh: None,
        subnet: None,
        ip_address: None,
        config: json!({"openvpn": [{"name": name, "mode": "server", "proto": "udp", "port": 1194}]}),
    }
}

/// WireGuard based server addressing its tunnels from `subnet`.
pub(crate) async fn wireguard_server(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    backend: VpnBackend,
    subnet: &str,
) -> VpnRecord {
    let mut config = json!({"wireguard": [{"name": "wg0", "port": 51820}]});
    if backend == VpnBackend::Vxlan {
        config["vxlan"] = json!([{"name": "vxlan1"}]);
    }
    crate::services::vpn::create_server(
        state,
        crate::services::vpn::VpnInput {
            organization_id,
            name: name.into(),
            host: format!("{name}.vpn.example.com"),
            backend,
            ca_id: None,
            cert_id: None,
            dh: None,
            subnet: Some(subnet.into()),
            ip_address: None,
            config,
        },
    )
    .await
    .expect("vpn server")
}

pub(crate) async fn openvpn_server(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
) -> VpnRecord {
    crate::services::vpn::create_server(state, openvpn_input(organization_id, name, None))
        .await
        .expect("vpn server")
}

pub(crate) async fn openvpn_server_with_ca(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    ca_id: Uuid,
) -> VpnRecord {
    crate::services::vpn::create_server(state, openvpn_input(organization_id, name, Some(ca_id)))
        .await
        .expect("vpn server")
}
