//! Template lifecycle and default/required propagation.

use common::api::{TemplateType, VpnBackend};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::compile;
use crate::app_state::AppState;
use crate::backend::AutoClientRequest;
use crate::error::{ApiResult, AppError};
use crate::events::ModifiedAction;
use crate::persistence::{
    ConfigFilter, ContextVars, TemplateRecord, TemplateRow, configs, templates,
};
use crate::tasks::BackgroundTask;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template name must not be empty")]
    EmptyName,
    #[error("required templates must also be default templates")]
    RequiredNotDefault,
    #[error("VPN templates must reference a VPN server")]
    VpnMissing,
    #[error("only VPN templates can reference a VPN server")]
    UnexpectedVpn,
    #[error("automatic certificates are only available for VPN templates")]
    UnexpectedAutoCert,
    #[error("the configuration of a template using a generic VPN server cannot be empty")]
    EmptyVpnConfig,
    #[error("a template named \"{0}\" already exists")]
    DuplicateName(String),
    #[error("the VPN server belongs to another organization")]
    VpnOrganizationMismatch,
}

#[derive(Debug, Clone)]
pub struct TemplateInput {
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub template_type: TemplateType,
    pub backend: String,
    pub vpn_id: Option<Uuid>,
    pub is_default: bool,
    pub required: bool,
    pub auto_cert: bool,
    pub default_values: ContextVars,
    pub config: Value,
    pub tags: Vec<String>,
}

impl TemplateInput {
    /// Generic template with no flags set.
    pub fn generic(organization_id: Option<Uuid>, name: impl Into<String>, backend: impl Into<String>, config: Value) -> Self {
        Self {
            organization_id,
            name: name.into(),
            template_type: TemplateType::Generic,
            backend: backend.into(),
            vpn_id: None,
            is_default: false,
            required: false,
            auto_cert: false,
            default_values: ContextVars::new(),
            config,
            tags: Vec::new(),
        }
    }

    fn row(self, id: Uuid) -> TemplateRow {
        TemplateRow {
            id,
            organization_id: self.organization_id,
            name: self.name,
            template_type: self.template_type,
            backend: self.backend,
            vpn_id: self.vpn_id,
            is_default: self.is_default,
            required: self.required,
            auto_cert: self.auto_cert,
            default_values: self.default_values,
            config: self.config,
            tags: self.tags,
        }
    }
}

/// Result of attaching a template to every eligible config.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

pub fn check_invariants(input: &TemplateInput) -> Result<(), TemplateError> {
    if input.name.trim().is_empty() {
        return Err(TemplateError::EmptyName);
    }
    if input.required && !input.is_default {
        return Err(TemplateError::RequiredNotDefault);
    }
    match input.template_type {
        TemplateType::Vpn if input.vpn_id.is_none() => Err(TemplateError::VpnMissing),
        TemplateType::Generic if input.vpn_id.is_some() => Err(TemplateError::UnexpectedVpn),
        TemplateType::Generic if input.auto_cert => Err(TemplateError::UnexpectedAutoCert),
        _ => Ok(()),
    }
}

fn is_empty_document(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Check invariants, fill the VPN client fragment and validate the
/// template on its own.
async fn prepare(state: &AppState, input: &mut TemplateInput) -> ApiResult<()> {
    check_invariants(input)?;
    if !input.config.is_object() && !input.config.is_null() {
        return Err(AppError::validation("template config must be a JSON object"));
    }
    let backend = state.backends.get(&input.backend)?;

    let mut vpn_vars = None;
    if let Some(vpn_id) = input.vpn_id {
        let (vpn, vars) = super::vpn::server_context(state, vpn_id)
            .await?
            .ok_or_else(|| AppError::not_found("vpn server not found"))?;
        if let (Some(vpn_org), Some(template_org)) = (vpn.organization_id, input.organization_id)
            && vpn_org != template_org
        {
            return Err(TemplateError::VpnOrganizationMismatch.into());
        }
        if is_empty_document(&input.config) {
            if vpn.backend == VpnBackend::Generic {
                return Err(TemplateError::EmptyVpnConfig.into());
            }
            let vpn_hex = vpn.id.simple().to_string();
            input.config = backend
                .auto_client(&AutoClientRequest {
                    vpn_backend: vpn.backend,
                    vpn_name: &vpn.name,
                    vpn_hex: &vpn_hex,
                    host: &vpn.host,
                    server: &vpn.config.0,
                    auto_cert: input.auto_cert,
                })
                .ok_or(TemplateError::EmptyVpnConfig)?;
        }
        vpn_vars = Some(vars);
    }
    if input.config.is_null() {
        input.config = Value::Object(serde_json::Map::new());
    }

    compile::validate_template(
        state,
        &input.backend,
        &input.config,
        &input.default_values,
        vpn_vars.as_ref(),
    )?;
    Ok(())
}

pub async fn get_template(state: &AppState, template_id: Uuid) -> ApiResult<TemplateRecord> {
    templates::get_template(&state.db, template_id)
        .await?
        .ok_or_else(|| AppError::not_found("template not found"))
}

pub async fn create_template(state: &AppState, mut input: TemplateInput) -> ApiResult<TemplateRecord> {
    prepare(state, &mut input).await?;
    if templates::name_exists(&state.db, input.organization_id, &input.name).await? {
        return Err(TemplateError::DuplicateName(input.name).into());
    }
    let propagate = input.is_default;
    let record = templates::insert_template(&state.db, &input.row(Uuid::new_v4())).await?;
    info!(template_id = %record.id, name = %record.name, "template created");
    if propagate {
        state
            .tasks
            .submit(state, BackgroundTask::PropagateTemplate { template_id: record.id })
            .await;
    }
    Ok(record)
}

/// Update a template. The owning organization is fixed at creation.
pub async fn update_template(
    state: &AppState,
    template_id: Uuid,
    mut input: TemplateInput,
) -> ApiResult<TemplateRecord> {
    let existing = get_template(state, template_id).await?;
    input.organization_id = existing.organization_id;
    prepare(state, &mut input).await?;
    if input.name != existing.name
        && templates::name_exists(&state.db, input.organization_id, &input.name).await?
    {
        return Err(TemplateError::DuplicateName(input.name).into());
    }

    let promoted = input.is_default && !existing.is_default;
    let content_changed = input.config != existing.config.0
        || input.default_values != existing.default_values.0
        || input.backend != existing.backend
        || input.vpn_id != existing.vpn_id
        || input.auto_cert != existing.auto_cert
        || input.template_type != existing.template_type;

    templates::update_template(&state.db, &input.row(template_id)).await?;
    info!(%template_id, promoted, content_changed, "template updated");

    if content_changed {
        let config_ids = configs::config_ids_for_template(&state.db, template_id).await?;
        if !config_ids.is_empty() {
            state.checksums.invalidate_many(&config_ids).await;
            state
                .tasks
                .submit(
                    state,
                    BackgroundTask::RecheckConfigs {
                        config_ids,
                        action: ModifiedAction::RelatedTemplateChanged,
                    },
                )
                .await;
        }
    }
    if promoted {
        state
            .tasks
            .submit(state, BackgroundTask::PropagateTemplate { template_id })
            .await;
    }
    get_template(state, template_id).await
}

/// Detach the template from every config, then delete it.
pub async fn delete_template(state: &AppState, template_id: Uuid) -> ApiResult<()> {
    get_template(state, template_id).await?;
    for config_id in configs::config_ids_for_template(&state.db, template_id).await? {
        super::configs::remove_template(state, config_id, template_id).await?;
    }
    templates::delete_template(&state.db, template_id).await?;
    info!(%template_id, "template deleted");
    Ok(())
}

fn clone_name(base: &str, attempt: usize) -> String {
    if attempt <= 1 {
        format!("{base} (Clone)")
    } else {
        format!("{base} (Clone {attempt})")
    }
}

/// Copy a template under the first free `(Clone)` name. Clones are never
/// default nor required.
pub async fn clone_template(state: &AppState, template_id: Uuid) -> ApiResult<TemplateRecord> {
    let source = get_template(state, template_id).await?;
    let mut attempt = 1;
    let mut name = clone_name(&source.name, attempt);
    while templates::name_exists(&state.db, source.organization_id, &name).await? {
        attempt += 1;
        name = clone_name(&source.name, attempt);
    }
    let row = TemplateRow {
        id: Uuid::new_v4(),
        organization_id: source.organization_id,
        name,
        template_type: source.template_type,
        backend: source.backend,
        vpn_id: source.vpn_id,
        is_default: false,
        required: false,
        auto_cert: source.auto_cert,
        default_values: source.default_values.0,
        config: source.config.0,
        tags: source.tags.0,
    };
    let record = templates::insert_template(&state.db, &row).await?;
    info!(source = %template_id, template_id = %record.id, name = %record.name, "template cloned");
    Ok(record)
}

/// Attach a default template to every active config of the same backend
/// that can use it and does not have it yet.
pub async fn propagate(state: &AppState, template_id: Uuid) -> crate::Result<PropagationReport> {
    let mut report = PropagationReport::default();
    let Some(template) = templates::get_template(&state.db, template_id).await? else {
        return Ok(report);
    };
    if !template.is_default {
        return Ok(report);
    }
    let filter = ConfigFilter {
        organization_id: template.organization_id,
        backend: Some(template.backend.clone()),
        template_id: None,
        exclude_deactivation: true,
    };
    let already: Vec<Uuid> = configs::config_ids_for_template(&state.db, template_id).await?;
    for config_id in configs::list_config_ids(&state.db, &filter).await? {
        if already.contains(&config_id) {
            continue;
        }
        match super::configs::attach_templates(state, config_id, vec![template_id]).await {
            Ok(_) => report.succeeded.push(config_id),
            Err(err) => {
                warn!(%template_id, %config_id, error = %err.message, "template propagation failed");
                report.failed.push((config_id, err.message));
            }
        }
    }
    info!(
        %template_id,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "template propagated"
    );
    Ok(report)
}
