//! Loading everything a config compiles from and running the backend.

use std::time::Instant;

use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::backend::{CompileError, RenderInput};
use crate::checksum::checksum_hex;
use crate::context::{self, ContextScopes, ContextView, ResolvedContext};
use crate::metrics::record_compile;
use crate::persistence::{
    ConfigRecord, ContextVars, DeviceGroupRecord, DeviceRecord, OrganizationRecord,
    TemplateRecord, configs, devices, organizations, templates, vpns,
};

/// Inputs of one config compilation. Callers may swap the template list or
/// the local document to compile a candidate before persisting it.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    pub device: DeviceRecord,
    pub organization: OrganizationRecord,
    pub group: Option<DeviceGroupRecord>,
    pub config: ConfigRecord,
    pub templates: Vec<TemplateRecord>,
    pub vpn_context: Vec<ContextVars>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub checksum: String,
    pub archive: Vec<u8>,
}

pub async fn load_sources_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    config_id: Uuid,
) -> crate::Result<Option<ConfigSources>> {
    let Some(config) = configs::get_config_tx(tx, config_id).await? else {
        return Ok(None);
    };
    let device = devices::get_device_tx(tx, config.device_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("config {config_id} has no device"))?;
    let organization = organizations::get_organization_tx(tx, device.organization_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("device {} has no organization", device.id))?;
    let group = match device.group_id {
        Some(group_id) => devices::get_group_tx(tx, group_id).await?,
        None => None,
    };
    let template_ids = configs::template_ids_tx(tx, config_id).await?;
    let templates = templates::get_templates_ordered_tx(tx, &template_ids).await?;
    let vpn_context = vpn_context_tx(state, tx, config_id).await?;

    Ok(Some(ConfigSources {
        device,
        organization,
        group,
        config,
        templates,
        vpn_context,
    }))
}

pub async fn load_sources(state: &AppState, config_id: Uuid) -> crate::Result<Option<ConfigSources>> {
    let mut tx = state.db.begin().await?;
    let sources = load_sources_tx(state, &mut tx, config_id).await?;
    tx.commit().await?;
    Ok(sources)
}

/// One context map per VPN client of the config, in attachment order.
pub async fn vpn_context_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    config_id: Uuid,
) -> crate::Result<Vec<ContextVars>> {
    let mut contexts = Vec::new();
    for client in vpns::vpn_clients_for_config_tx(tx, config_id).await? {
        let Some(vpn) = vpns::get_vpn_tx(tx, client.vpn_id).await? else {
            continue;
        };
        let ca = match vpn.ca_id {
            Some(ca_id) => vpns::get_ca_tx(tx, ca_id).await?,
            None => None,
        };
        let cert = match client.cert_id {
            Some(cert_id) => vpns::get_cert_tx(tx, cert_id).await?,
            None => None,
        };
        contexts.push(context::vpn_client_context(
            &vpn,
            ca.as_ref(),
            &client,
            cert.as_ref(),
            &state.vpn.cert_path,
        ));
    }
    Ok(contexts)
}

pub fn resolve_context(state: &AppState, sources: &ConfigSources, view: ContextView) -> ResolvedContext {
    state.context.resolve(
        ContextScopes {
            device: &sources.device,
            organization: &sources.organization.context.0,
            group: sources.group.as_ref().map(|group| &group.context.0),
            vpn: &sources.vpn_context,
            overrides: &sources.config.context.0,
        },
        view,
    )
}

fn fragments(templates: &[TemplateRecord]) -> Vec<Value> {
    templates.iter().map(|template| template.config.0.clone()).collect()
}

/// Validate the compiled document without packing it.
pub fn validate(state: &AppState, sources: &ConfigSources) -> Result<Value, CompileError> {
    let backend = state.backends.get(&sources.config.backend)?;
    let context = resolve_context(state, sources, ContextView::Device);
    let fragments = fragments(&sources.templates);
    let input = RenderInput {
        config: &sources.config.config.0,
        fragments: &fragments,
        context: &context,
        device_name: Some(&sources.device.name),
        options: state
            .backends
            .options_for(backend.as_ref(), sources.device.os.as_deref()),
    };
    backend.validate(&input)
}

pub fn compile(state: &AppState, sources: &ConfigSources) -> Result<Compiled, CompileError> {
    let backend = state.backends.get(&sources.config.backend)?;
    let context = resolve_context(state, sources, ContextView::Device);
    let fragments = fragments(&sources.templates);
    let input = RenderInput {
        config: &sources.config.config.0,
        fragments: &fragments,
        context: &context,
        device_name: Some(&sources.device.name),
        options: state
            .backends
            .options_for(backend.as_ref(), sources.device.os.as_deref()),
    };
    let started = Instant::now();
    let generated = backend.generate(&input);
    record_compile(backend.id(), generated.is_ok(), started.elapsed());
    let archive = generated?;
    Ok(Compiled {
        checksum: checksum_hex(&archive),
        archive,
    })
}

/// Validate a template on its own: its fragment rendered with its default
/// values, the VPN server context and the global defaults.
pub fn validate_template(
    state: &AppState,
    backend_id: &str,
    config: &Value,
    default_values: &ContextVars,
    vpn_server: Option<&ContextVars>,
) -> Result<Value, CompileError> {
    let backend = state.backends.get(backend_id)?;
    let context = state.context.template_context(default_values, vpn_server);
    let empty = Value::Object(serde_json::Map::new());
    let fragments = [config.clone()];
    let input = RenderInput {
        config: &empty,
        fragments: &fragments,
        context: &context,
        device_name: None,
        options: Default::default(),
    };
    backend.validate(&input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{self, setup_state};
    use serde_json::json;

    #[tokio::test]
    async fn compile_is_deterministic() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let sources = load_sources(&state, config_id).await.expect("db").expect("sources");
        let first = compile(&state, &sources).expect("compile");
        let second = compile(&state, &sources).expect("compile");
        assert_eq!(first, second);
        assert_eq!(first.checksum.len(), 64);
    }

    #[tokio::test]
    async fn template_order_changes_the_output() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        let a = test_support::template(&state, Some(org.id), "a", json!({"general": {"timezone": "UTC"}})).await;
        let b = test_support::template(&state, Some(org.id), "b", json!({"general": {"timezone": "CET"}})).await;

        let mut sources = load_sources(&state, config_id).await.expect("db").expect("sources");
        sources.templates = vec![a.clone(), b.clone()];
        let ab = compile(&state, &sources).expect("compile");
        let document = validate(&state, &sources).expect("valid");
        assert_eq!(document["general"]["timezone"], "CET");

        sources.templates = vec![b, a];
        let ba = compile(&state, &sources).expect("compile");
        assert_ne!(ab.checksum, ba.checksum);
    }

    #[tokio::test]
    async fn hostname_defaults_to_device_name() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "00:11:22:33:44:55", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let sources = load_sources(&state, config_id).await.expect("db").expect("sources");
        let document = validate(&state, &sources).expect("valid");
        assert_eq!(document["general"]["hostname"], "00-11-22-33-44-55");
    }
}
