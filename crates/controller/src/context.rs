//! Layering of variable scopes into the substitution map handed to the
//! backend compiler.
//!
//! Scopes apply lowest priority first: global defaults, organization,
//! device group, VPN clients, registered context functions, the hardware
//! id and finally the per-device overrides. Identity variables (`name`,
//! `mac_address`, `id`, `key`) are emitted first and no scope can replace
//! them.

use std::{fmt, sync::Arc};

use serde_json::Value;

use crate::persistence::{
    CaRecord, CertRecord, ContextVars, DeviceRecord, VpnClientRecord, VpnRecord,
};

pub const IDENTITY_KEYS: [&str; 4] = ["name", "mac_address", "id", "key"];

/// Which rendering a context is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextView {
    /// What the device downloads; includes per-device overrides.
    Device,
    /// Derived values only, without per-device overrides.
    System,
}

/// Scopes collected by the caller for one config.
#[derive(Debug, Clone, Copy)]
pub struct ContextScopes<'a> {
    pub device: &'a DeviceRecord,
    pub organization: &'a ContextVars,
    pub group: Option<&'a ContextVars>,
    /// One map per attached VPN client, in attachment order.
    pub vpn: &'a [ContextVars],
    pub overrides: &'a ContextVars,
}

/// Resolved variables: identity first, remaining keys sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedContext {
    identity: Vec<(String, Value)>,
    extras: ContextVars,
}

impl ResolvedContext {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.identity
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
            .or_else(|| self.extras.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.identity
            .iter()
            .map(|(key, value)| (key.as_str(), value))
            .chain(self.extras.iter().map(|(key, value)| (key.as_str(), value)))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.iter().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.identity.len() + self.extras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a variable rendered as text, the form used for substitution.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).map(value_as_text)
    }

    fn from_vars(vars: ContextVars) -> Self {
        Self {
            identity: Vec::new(),
            extras: vars,
        }
    }
}

pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Function contributing variables computed from the device.
pub type ContextFunction = Arc<dyn Fn(&DeviceRecord) -> ContextVars + Send + Sync>;

/// Ordered registry of context functions, filled at startup.
#[derive(Clone, Default)]
pub struct ContextFunctions {
    entries: Vec<(String, ContextFunction)>,
}

impl ContextFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same name twice replaces the earlier function in
    /// place.
    pub fn register(&mut self, name: impl Into<String>, function: ContextFunction) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            slot.1 = function;
        } else {
            self.entries.push((name, function));
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    fn apply(&self, device: &DeviceRecord, into: &mut ContextVars) {
        for (_, function) in &self.entries {
            into.extend(function(device));
        }
    }
}

impl fmt::Debug for ContextFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ContextResolver {
    global: ContextVars,
    functions: ContextFunctions,
    hardware_id_enabled: bool,
}

impl ContextResolver {
    pub fn new(global: ContextVars, functions: ContextFunctions, hardware_id_enabled: bool) -> Self {
        Self {
            global,
            functions,
            hardware_id_enabled,
        }
    }

    pub fn from_config(cfg: &crate::config::AppConfig, functions: ContextFunctions) -> Self {
        let global = cfg
            .context
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        Self::new(global, functions, cfg.hardware_id.enabled)
    }

    pub fn global(&self) -> &ContextVars {
        &self.global
    }

    pub fn hardware_id_enabled(&self) -> bool {
        self.hardware_id_enabled
    }

    pub fn resolve(&self, scopes: ContextScopes<'_>, view: ContextView) -> ResolvedContext {
        let device = scopes.device;
        let identity = vec![
            ("name".to_string(), Value::String(device.name.clone())),
            (
                "mac_address".to_string(),
                Value::String(device.mac_address.clone()),
            ),
            ("id".to_string(), Value::String(device.id.to_string())),
            ("key".to_string(), Value::String(device.key.clone())),
        ];

        let mut extras = self.global.clone();
        extras.extend(scopes.organization.clone());
        if let Some(group) = scopes.group {
            extras.extend(group.clone());
        }
        for vpn in scopes.vpn {
            extras.extend(vpn.clone());
        }
        self.functions.apply(device, &mut extras);
        if self.hardware_id_enabled {
            extras.insert(
                "hardware_id".into(),
                Value::String(device.hardware_id.clone().unwrap_or_default()),
            );
        }
        if view == ContextView::Device {
            extras.extend(scopes.overrides.clone());
        }
        for key in IDENTITY_KEYS {
            extras.remove(key);
        }

        ResolvedContext { identity, extras }
    }

    /// Context for rendering a template on its own: `default_values`, then
    /// the VPN server context, then global defaults.
    pub fn template_context(
        &self,
        default_values: &ContextVars,
        vpn_server: Option<&ContextVars>,
    ) -> ResolvedContext {
        let mut vars = default_values.clone();
        if let Some(server) = vpn_server {
            vars.extend(server.clone());
        }
        vars.extend(self.global.clone());
        ResolvedContext::from_vars(vars)
    }
}

/// Server-side VPN variables: host, CA material, public key and tunnel
/// addressing.
pub fn vpn_server_context(vpn: &VpnRecord, ca: Option<&CaRecord>, cert_path: &str) -> ContextVars {
    let vpn_hex = vpn.id.simple().to_string();
    let mut vars = ContextVars::new();
    if !vpn.host.is_empty() {
        vars.insert(format!("vpn_host_{vpn_hex}"), Value::String(vpn.host.clone()));
    }
    if vpn.backend.uses_wireguard_keys() {
        let port = vpn
            .config
            .0
            .get("wireguard")
            .and_then(|servers| servers.get(0))
            .and_then(|server| server.get("port"))
            .cloned()
            .unwrap_or(Value::from(51820));
        vars.insert(format!("vpn_port_{vpn_hex}"), Value::String(value_as_text(&port)));
    }
    if let Some(public_key) = vpn.public_key.as_deref() {
        vars.insert(format!("public_key_{vpn_hex}"), Value::String(public_key.into()));
    }
    if let (Some(ip), Some(subnet)) = (vpn.ip_address.as_deref(), vpn.subnet.as_deref()) {
        vars.insert(format!("server_ip_address_{vpn_hex}"), Value::String(ip.into()));
        vars.insert(format!("server_ip_network_{vpn_hex}"), Value::String(format!("{ip}/32")));
        vars.insert(format!("vpn_subnet_{vpn_hex}"), Value::String(subnet.into()));
    }
    if let Some(ca) = ca {
        let filename = format!(
            "ca-{}-{}.pem",
            ca.id.simple(),
            ca.common_name.replace(' ', "_")
        );
        vars.insert(
            format!("ca_path_{vpn_hex}"),
            Value::String(format!("{cert_path}/{filename}")),
        );
        vars.insert(
            format!("ca_contents_{vpn_hex}"),
            Value::String(ca.certificate.clone()),
        );
    }
    vars
}

/// Variables injected by one VPN client: the server context plus the
/// client certificate, keys and addressing when present.
pub fn vpn_client_context(
    vpn: &VpnRecord,
    ca: Option<&CaRecord>,
    client: &VpnClientRecord,
    cert: Option<&CertRecord>,
    cert_path: &str,
) -> ContextVars {
    let vpn_hex = vpn.id.simple().to_string();
    let mut vars = vpn_server_context(vpn, ca, cert_path);
    if let Some(cert) = cert {
        vars.insert(
            format!("cert_path_{vpn_hex}"),
            Value::String(format!("{cert_path}/client-{vpn_hex}.pem")),
        );
        vars.insert(
            format!("cert_contents_{vpn_hex}"),
            Value::String(cert.certificate.clone()),
        );
        vars.insert(
            format!("key_path_{vpn_hex}"),
            Value::String(format!("{cert_path}/key-{vpn_hex}.pem")),
        );
        vars.insert(
            format!("key_contents_{vpn_hex}"),
            Value::String(cert.private_key.clone()),
        );
    }
    if let Some(public_key) = client.public_key.as_deref().filter(|key| !key.is_empty()) {
        vars.insert(format!("pub_key_{vpn_hex}"), Value::String(public_key.into()));
    }
    if let Some(private_key) = client.private_key.as_deref().filter(|key| !key.is_empty()) {
        vars.insert(format!("pvt_key_{vpn_hex}"), Value::String(private_key.into()));
    }
    if let Some(ip) = client.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
        vars.insert(format!("ip_address_{vpn_hex}"), Value::String(ip.into()));
    }
    if let Some(vni) = client.vni {
        vars.insert(format!("vni_{vpn_hex}"), Value::String(vni.to_string()));
    }
    vars
}
