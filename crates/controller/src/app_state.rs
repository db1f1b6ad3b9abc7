use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    backend::BackendRegistry,
    checksum::ChecksumCache,
    config::{LimitsConfig, RegistrationConfig, VpnConfig},
    context::ContextResolver,
    events::EventBus,
    persistence,
    pki::{CertIssuer, DhGenerator},
    tasks::TaskRunner,
};

/// Shared application state passed into handlers, services and tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub registration: RegistrationConfig,
    pub vpn: VpnConfig,
    pub limits: LimitsConfig,
    pub backends: Arc<BackendRegistry>,
    pub context: Arc<ContextResolver>,
    pub checksums: ChecksumCache,
    pub events: EventBus,
    /// Issues client and server certificates for VPN provisioning.
    pub cert_issuer: Arc<dyn CertIssuer>,
    pub dh_generator: Arc<dyn DhGenerator>,
    pub tasks: TaskRunner,
    pub metrics_handle: PrometheusHandle,
}
