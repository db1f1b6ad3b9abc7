//! VPN servers and the per-device clients provisioned from VPN templates.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use common::api::{TemplateType, VpnBackend};
use serde_json::{Value, json};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::AfterCommit;
use super::compile::ConfigSources;
use crate::addressing::{self, Subnet};
use crate::app_state::AppState;
use crate::backend::RenderInput;
use crate::checksum::checksum_hex;
use crate::context;
use crate::error::{ApiResult, AppError, is_unique_violation};
use crate::events::{ConfigEvent, ModifiedAction};
use crate::keys;
use crate::persistence::{
    CaRecord, CertRecord, ContextVars, DeviceRecord, NewCert, NewVpnClient, VpnRecord, VpnRow,
    vpns,
};
use crate::pki::{CertRequest, DH_PLACEHOLDER};
use crate::tasks::BackgroundTask;

const DEFAULT_COMMON_NAME_FORMAT: &str = "{mac_address}-{name}";
const COMMON_NAME_MAX_LEN: usize = 55;
const DEVICE_NAME_BUDGET: usize = 63;
/// Backend rendering the server's own configuration package.
const SERVER_BACKEND: &str = "netjson";

#[derive(Debug, Clone)]
pub struct VpnInput {
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub host: String,
    pub backend: VpnBackend,
    pub ca_id: Option<Uuid>,
    /// Existing server certificate; one is issued from the CA when absent.
    pub cert_id: Option<Uuid>,
    /// DH parameters; openvpn servers without them get a placeholder until
    /// the background generation finishes.
    pub dh: Option<String>,
    /// IPv4 network tunnel addresses are allocated from; required by
    /// WireGuard based backends.
    pub subnet: Option<String>,
    /// Server address inside `subnet`; the first host when absent.
    pub ip_address: Option<String>,
    pub config: Value,
}

/// Certificate common name for a device's VPN client.
pub fn client_common_name(format: &str, device: &DeviceRecord) -> String {
    let mac = device.mac_address.as_str();
    let name: String = device
        .name
        .chars()
        .take(DEVICE_NAME_BUDGET.saturating_sub(mac.len()))
        .collect();
    let format = if format == DEFAULT_COMMON_NAME_FORMAT && name == mac {
        "{mac_address}"
    } else {
        format
    };
    let rendered = format
        .replace("{mac_address}", mac)
        .replace("{name}", &name)
        .replace("{id}", &device.id.to_string())
        .replace("{key}", &device.key);
    let truncated: String = rendered.chars().take(COMMON_NAME_MAX_LEN).collect();
    format!("{truncated}-{}", keys::random_slug(8))
}

async fn load_ca_tx(
    tx: &mut Transaction<'_, Sqlite>,
    ca_id: Option<Uuid>,
    organization_id: Option<Uuid>,
) -> ApiResult<Option<CaRecord>> {
    let Some(ca_id) = ca_id else {
        return Ok(None);
    };
    let ca = vpns::get_ca_tx(tx, ca_id)
        .await?
        .ok_or_else(|| AppError::not_found("certificate authority not found"))?;
    if let (Some(owner), Some(vpn_org)) = (ca.organization_id, organization_id)
        && owner != vpn_org
    {
        return Err(AppError::validation(
            "certificate authority belongs to another organization",
        ));
    }
    Ok(Some(ca))
}

fn assign_server_address(row: &mut VpnRow) -> ApiResult<()> {
    let Some(raw_subnet) = row.subnet.as_deref() else {
        if row.backend.requires_subnet() {
            return Err(AppError::validation("subnet is required for this vpn backend"));
        }
        if row.ip_address.is_some() {
            return Err(AppError::validation("vpn ip address needs a subnet"));
        }
        return Ok(());
    };
    let subnet: Subnet = raw_subnet.parse()?;
    let address = match row.ip_address.as_deref() {
        Some(raw) => subnet.member(raw)?,
        None => subnet.next_free(&HashSet::new())?,
    };
    row.subnet = Some(subnet.to_string());
    row.ip_address = Some(address.to_string());
    Ok(())
}

/// Fill in tunnel addressing, key pair, server certificate and DH
/// placeholder.
async fn provision_server_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    row: &mut VpnRow,
    ca: Option<&CaRecord>,
    after: &mut AfterCommit,
) -> ApiResult<()> {
    assign_server_address(row)?;
    if row.backend.uses_wireguard_keys() && (row.public_key.is_none() || row.private_key.is_none()) {
        let keys = keys::generate_wireguard_keys();
        row.private_key = Some(keys.private_key);
        row.public_key = Some(keys.public_key);
    }
    if row.cert_id.is_none()
        && let Some(ca) = ca
    {
        let issued = state.cert_issuer.issue(&CertRequest {
            common_name: &row.name,
            organization: None,
            ca: Some(ca),
        })?;
        let cert_id = Uuid::new_v4();
        vpns::insert_cert_tx(
            tx,
            &NewCert {
                id: cert_id,
                organization_id: row.organization_id,
                ca_id: Some(ca.id),
                name: row.name.clone(),
                common_name: row.name.clone(),
                certificate: issued.certificate,
                private_key: issued.private_key,
            },
        )
        .await?;
        row.cert_id = Some(cert_id);
        debug!(vpn_id = %row.id, %cert_id, "issued vpn server certificate");
    }
    if row.backend == VpnBackend::OpenVpn && row.dh.trim().is_empty() {
        row.dh = DH_PLACEHOLDER.to_string();
    }
    if row.backend == VpnBackend::OpenVpn && row.dh == DH_PLACEHOLDER {
        after.task(BackgroundTask::GenerateDh { vpn_id: row.id });
    }
    Ok(())
}

fn validate_input(input: &VpnInput) -> ApiResult<()> {
    if input.name.trim().is_empty() {
        return Err(AppError::validation("vpn name must not be empty"));
    }
    if input.host.trim().is_empty() {
        return Err(AppError::validation("vpn host must not be empty"));
    }
    if !input.config.is_object() {
        return Err(AppError::validation("vpn config must be a JSON object"));
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub async fn create_server(state: &AppState, input: VpnInput) -> ApiResult<VpnRecord> {
    validate_input(&input)?;
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let ca = load_ca_tx(&mut tx, input.ca_id, input.organization_id).await?;
    let mut row = VpnRow {
        id: Uuid::new_v4(),
        organization_id: input.organization_id,
        name: input.name,
        host: input.host,
        backend: input.backend,
        ca_id: input.ca_id,
        cert_id: input.cert_id,
        dh: input.dh.unwrap_or_default(),
        key: keys::generate_key(),
        subnet: non_blank(input.subnet),
        ip_address: non_blank(input.ip_address),
        public_key: None,
        private_key: None,
        config: input.config,
    };
    provision_server_tx(state, &mut tx, &mut row, ca.as_ref(), &mut after).await?;
    vpns::insert_vpn_tx(&mut tx, &row).await?;
    tx.commit().await?;
    info!(vpn_id = %row.id, backend = row.backend.as_str(), "vpn server created");
    after.run(state).await;
    get_server(state, row.id).await
}

pub async fn update_server(state: &AppState, vpn_id: Uuid, input: VpnInput) -> ApiResult<VpnRecord> {
    validate_input(&input)?;
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let existing = vpns::get_vpn_tx(&mut tx, vpn_id)
        .await?
        .ok_or_else(|| AppError::not_found("vpn server not found"))?;
    let ca = load_ca_tx(&mut tx, input.ca_id, existing.organization_id).await?;
    let subnet = non_blank(input.subnet);
    let ip_address = match non_blank(input.ip_address) {
        Some(ip_address) => Some(ip_address),
        None if subnet == existing.subnet => existing.ip_address,
        None => None,
    };
    let mut row = VpnRow {
        id: vpn_id,
        organization_id: existing.organization_id,
        name: input.name,
        host: input.host,
        backend: input.backend,
        ca_id: input.ca_id,
        cert_id: input.cert_id.or(existing.cert_id),
        dh: input.dh.unwrap_or(existing.dh),
        key: existing.key,
        subnet,
        ip_address,
        public_key: existing.public_key,
        private_key: existing.private_key,
        config: input.config,
    };
    if row.ca_id != existing.ca_id {
        row.cert_id = input.cert_id;
    }
    provision_server_tx(state, &mut tx, &mut row, ca.as_ref(), &mut after).await?;
    vpns::update_vpn_tx(&mut tx, &row).await?;
    tx.commit().await?;
    after.run(state).await;
    info!(%vpn_id, "vpn server updated");
    server_changed(state, vpn_id).await?;
    get_server(state, vpn_id).await
}

pub async fn get_server(state: &AppState, vpn_id: Uuid) -> ApiResult<VpnRecord> {
    vpns::get_vpn(&state.db, vpn_id)
        .await?
        .ok_or_else(|| AppError::not_found("vpn server not found"))
}

/// Server context used when a VPN template is validated on its own.
pub async fn server_context(state: &AppState, vpn_id: Uuid) -> crate::Result<Option<(VpnRecord, ContextVars)>> {
    let Some(vpn) = vpns::get_vpn(&state.db, vpn_id).await? else {
        return Ok(None);
    };
    let ca = match vpn.ca_id {
        Some(ca_id) => vpns::get_ca(&state.db, ca_id).await?,
        None => None,
    };
    let vars = context::vpn_server_context(&vpn, ca.as_ref(), &state.vpn.cert_path);
    Ok(Some((vpn, vars)))
}

/// Drop cached checksums of every config using the server and recompile
/// them.
pub async fn server_changed(state: &AppState, vpn_id: Uuid) -> crate::Result<()> {
    let config_ids = vpns::config_ids_for_vpn(&state.db, vpn_id).await?;
    state.checksums.invalidate_many(&config_ids).await;
    super::configs::recheck_many(state, &config_ids, ModifiedAction::ConfigChanged).await?;
    state.events.emit(ConfigEvent::VpnServerModified { vpn_id }).await;
    Ok(())
}

/// A server's own configuration, packed the way device packages are.
#[derive(Debug, Clone)]
pub struct ServerPackage {
    pub file_name: String,
    pub checksum: String,
    pub archive: Vec<u8>,
}

fn push_file(document: &mut Value, path: String, mode: &str, contents: String) {
    let Value::Object(root) = document else {
        return;
    };
    let files = root
        .entry("files")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(files) = files {
        files.push(json!({"path": path, "mode": mode, "contents": contents}));
    }
}

/// Server config document with generated material filled in: the private
/// key, address and peer list of WireGuard servers, the VXLAN peer file and
/// the OpenVPN certificate files.
async fn server_document(state: &AppState, vpn: &VpnRecord, ca: Option<&CaRecord>) -> ApiResult<Value> {
    let mut document = vpn.config.0.clone();
    let clients = vpns::addressed_clients(&state.db, vpn.id).await?;

    if vpn.backend.uses_wireguard_keys()
        && let Some(server) = document
            .get_mut("wireguard")
            .and_then(|servers| servers.get_mut(0))
            .and_then(Value::as_object_mut)
    {
        if let Some(private_key) = &vpn.private_key {
            server.insert("private_key".into(), json!(private_key));
        }
        if let (Some(ip), Some(subnet)) = (&vpn.ip_address, &vpn.subnet) {
            let subnet: Subnet = subnet.parse()?;
            server.insert("address".into(), json!(format!("{ip}/{}", subnet.prefix_len())));
        }
        let peers: Vec<Value> = clients
            .iter()
            .filter_map(|client| {
                let ip = client.ip_address.as_deref()?;
                Some(json!({"public_key": client.public_key, "allowed_ips": format!("{ip}/32")}))
            })
            .collect();
        server.insert("peers".into(), Value::Array(peers));
    }

    if vpn.backend == VpnBackend::Vxlan {
        let shared_vni = fixed_vni(&document);
        let interface = document
            .get("vxlan")
            .and_then(|tunnels| tunnels.get(0))
            .and_then(|tunnel| tunnel.get("name"))
            .cloned();
        let peers: Vec<Value> = clients
            .iter()
            .filter_map(|client| {
                let remote = client.ip_address.as_deref()?;
                let mut peer = json!({"vni": client.vni.or(shared_vni), "remote": remote});
                if let (Some(name), Value::Object(peer)) = (&interface, &mut peer) {
                    peer.insert("interface".into(), name.clone());
                }
                Some(peer)
            })
            .collect();
        let contents = serde_json::to_string_pretty(&peers).map_err(anyhow::Error::from)?;
        push_file(&mut document, "vxlan.json".into(), "0644", contents);
    }

    if vpn.backend == VpnBackend::OpenVpn {
        let vpn_hex = vpn.id.simple();
        let cert_path = &state.vpn.cert_path;
        if let Some(ca) = ca {
            let ca_file = format!("ca-{}-{}.pem", ca.id.simple(), ca.common_name.replace(' ', "_"));
            push_file(&mut document, format!("{cert_path}/{ca_file}"), "0600", ca.certificate.clone());
        }
        if let Some(cert_id) = vpn.cert_id
            && let Some(cert) = vpns::get_cert(&state.db, cert_id).await?
        {
            push_file(&mut document, format!("{cert_path}/server-{vpn_hex}.pem"), "0600", cert.certificate);
            push_file(&mut document, format!("{cert_path}/server-key-{vpn_hex}.pem"), "0600", cert.private_key);
        }
        if !vpn.dh.is_empty() && vpn.dh != DH_PLACEHOLDER {
            push_file(&mut document, format!("{cert_path}/dh-{vpn_hex}.pem"), "0600", vpn.dh.clone());
        }
    }
    Ok(document)
}

/// Render and pack the server configuration. Nothing is cached: peers
/// change whenever a client is provisioned or removed.
pub async fn server_package(state: &AppState, vpn: &VpnRecord) -> ApiResult<ServerPackage> {
    let ca = match vpn.ca_id {
        Some(ca_id) => vpns::get_ca(&state.db, ca_id).await?,
        None => None,
    };
    let document = server_document(state, vpn, ca.as_ref()).await?;
    let vars = context::vpn_server_context(vpn, ca.as_ref(), &state.vpn.cert_path);
    let context = state.context.template_context(&ContextVars::new(), Some(&vars));
    let backend = state.backends.get(SERVER_BACKEND)?;
    let archive = backend.generate(&RenderInput {
        config: &document,
        fragments: &[],
        context: &context,
        device_name: None,
        options: state.backends.options_for(backend.as_ref(), None),
    })?;
    Ok(ServerPackage {
        file_name: format!("{}.tar.gz", vpn.name),
        checksum: checksum_hex(&archive),
        archive,
    })
}

/// Make the VPN clients of a config match its VPN templates: one client per
/// server, created with an optional certificate, removed with its
/// auto-issued certificate once no attached template references it.
pub(crate) async fn reconcile_clients_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    sources: &ConfigSources,
    after: &mut AfterCommit,
) -> ApiResult<()> {
    let config_id = sources.config.id;
    let mut wanted: HashMap<Uuid, (Uuid, bool)> = HashMap::new();
    let mut wanted_order = Vec::new();
    for template in &sources.templates {
        if template.template_type != TemplateType::Vpn {
            continue;
        }
        let Some(vpn_id) = template.vpn_id else {
            continue;
        };
        if !wanted.contains_key(&vpn_id) {
            wanted.insert(vpn_id, (template.id, template.auto_cert));
            wanted_order.push(vpn_id);
        }
    }
    let attached: HashSet<Uuid> = sources.templates.iter().map(|template| template.id).collect();

    let existing = vpns::vpn_clients_for_config_tx(tx, config_id).await?;
    let mut present = HashSet::new();
    for client in existing {
        if attached.contains(&client.template_id) && wanted.contains_key(&client.vpn_id) {
            present.insert(client.vpn_id);
            continue;
        }
        vpns::delete_vpn_client_tx(tx, client.id).await?;
        if client.auto_cert
            && let Some(cert_id) = client.cert_id
        {
            vpns::delete_cert_tx(tx, cert_id).await?;
        }
        after.invalidate(config_id);
        info!(%config_id, vpn_id = %client.vpn_id, "vpn client removed");
    }

    for vpn_id in wanted_order {
        if present.contains(&vpn_id) {
            continue;
        }
        let (template_id, auto_cert) = wanted[&vpn_id];
        let vpn = vpns::get_vpn_tx(tx, vpn_id)
            .await?
            .ok_or_else(|| AppError::not_found("vpn server not found"))?;
        let cert_id = if auto_cert && !vpn.backend.uses_wireguard_keys() {
            Some(issue_client_cert_tx(state, tx, sources, &vpn).await?)
        } else {
            None
        };
        let assigned = if auto_cert {
            assign_client_tx(tx, &vpn).await?
        } else {
            ClientAssignment::default()
        };
        let inserted = vpns::insert_vpn_client_tx(
            tx,
            &NewVpnClient {
                id: Uuid::new_v4(),
                config_id,
                vpn_id,
                template_id,
                cert_id,
                auto_cert,
                public_key: assigned.public_key,
                private_key: assigned.private_key,
                ip_address: assigned.ip_address,
                vni: assigned.vni,
            },
        )
        .await;
        match inserted {
            Ok(()) => info!(%config_id, %vpn_id, auto_cert, "vpn client created"),
            Err(err) if is_unique_violation(&err) => {
                debug!(%config_id, %vpn_id, "vpn client already exists");
                if let Some(cert_id) = cert_id {
                    vpns::delete_cert_tx(tx, cert_id).await?;
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Material handed to a new client of an auto-provisioned VPN template.
#[derive(Debug, Default)]
struct ClientAssignment {
    public_key: Option<String>,
    private_key: Option<String>,
    ip_address: Option<String>,
    vni: Option<i64>,
}

/// VNI shared by every tunnel of a VXLAN server, when its config sets one.
fn fixed_vni(config: &Value) -> Option<i64> {
    config.get("vxlan")?.get(0)?.get("vni")?.as_i64()
}

async fn assign_client_tx(
    tx: &mut Transaction<'_, Sqlite>,
    vpn: &VpnRecord,
) -> ApiResult<ClientAssignment> {
    let mut assigned = ClientAssignment::default();
    if vpn.backend.uses_wireguard_keys() {
        let keys = keys::generate_wireguard_keys();
        assigned.private_key = Some(keys.private_key);
        assigned.public_key = Some(keys.public_key);
    }
    if let Some(raw_subnet) = vpn.subnet.as_deref() {
        let subnet: Subnet = raw_subnet.parse()?;
        let mut used: HashSet<Ipv4Addr> = vpns::client_addresses_tx(tx, vpn.id)
            .await?
            .iter()
            .filter_map(|address| address.parse().ok())
            .collect();
        if let Some(server) = vpn.ip_address.as_deref().and_then(|address| address.parse().ok()) {
            used.insert(server);
        }
        assigned.ip_address = Some(subnet.next_free(&used)?.to_string());
    }
    if vpn.backend == VpnBackend::Vxlan && fixed_vni(&vpn.config.0).is_none() {
        let highest = vpns::highest_vni_tx(tx, vpn.id).await?;
        assigned.vni = Some(addressing::next_vni(highest)?);
    }
    Ok(assigned)
}

async fn issue_client_cert_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    sources: &ConfigSources,
    vpn: &VpnRecord,
) -> ApiResult<Uuid> {
    let ca = match vpn.ca_id {
        Some(ca_id) => vpns::get_ca_tx(tx, ca_id).await?,
        None => None,
    };
    let common_name = client_common_name(&state.vpn.common_name_format, &sources.device);
    let issued = state.cert_issuer.issue(&CertRequest {
        common_name: &common_name,
        organization: Some(&sources.organization.name),
        ca: ca.as_ref(),
    })?;
    let cert_id = Uuid::new_v4();
    vpns::insert_cert_tx(
        tx,
        &NewCert {
            id: cert_id,
            organization_id: Some(sources.device.organization_id),
            ca_id: ca.as_ref().map(|ca| ca.id),
            name: common_name.clone(),
            common_name,
            certificate: issued.certificate,
            private_key: issued.private_key,
        },
    )
    .await?;
    Ok(cert_id)
}

pub async fn create_ca(
    state: &AppState,
    organization_id: Option<Uuid>,
    name: &str,
    common_name: &str,
) -> ApiResult<CaRecord> {
    if name.trim().is_empty() || common_name.trim().is_empty() {
        return Err(AppError::validation("certificate authority needs a name and common name"));
    }
    let issued = state.cert_issuer.create_ca(common_name)?;
    let ca = vpns::insert_ca(
        &state.db,
        organization_id,
        name,
        common_name,
        &issued.certificate,
        &issued.private_key,
    )
    .await?;
    info!(ca_id = %ca.id, "certificate authority created");
    Ok(ca)
}

async fn recheck_cert_owners(state: &AppState, cert_id: Uuid) -> crate::Result<()> {
    let config_ids = vpns::config_ids_for_cert(&state.db, cert_id).await?;
    if config_ids.is_empty() {
        return Ok(());
    }
    state.checksums.invalidate_many(&config_ids).await;
    state
        .tasks
        .submit(
            state,
            BackgroundTask::RecheckConfigs {
                config_ids,
                action: ModifiedAction::ConfigChanged,
            },
        )
        .await;
    Ok(())
}

pub async fn revoke_cert(state: &AppState, cert_id: Uuid) -> ApiResult<()> {
    if vpns::mark_cert_revoked(&state.db, cert_id).await? == 0 {
        return Err(AppError::not_found("certificate not found"));
    }
    info!(%cert_id, "certificate revoked");
    recheck_cert_owners(state, cert_id).await?;
    Ok(())
}

/// Issue fresh material under the same common name.
pub async fn renew_cert(state: &AppState, cert_id: Uuid) -> ApiResult<CertRecord> {
    let cert = vpns::get_cert(&state.db, cert_id)
        .await?
        .ok_or_else(|| AppError::not_found("certificate not found"))?;
    let ca = match cert.ca_id {
        Some(ca_id) => vpns::get_ca(&state.db, ca_id).await?,
        None => None,
    };
    let issued = state.cert_issuer.issue(&CertRequest {
        common_name: &cert.common_name,
        organization: None,
        ca: ca.as_ref(),
    })?;
    vpns::update_cert_material(&state.db, cert_id, &issued.certificate, &issued.private_key).await?;
    info!(%cert_id, "certificate renewed");
    recheck_cert_owners(state, cert_id).await?;
    vpns::get_cert(&state.db, cert_id)
        .await?
        .ok_or_else(|| AppError::not_found("certificate not found"))
}
