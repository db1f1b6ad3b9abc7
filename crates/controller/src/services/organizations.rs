use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::events::ModifiedAction;
use crate::keys;
use crate::persistence::{
    ConfigFilter, ContextVars, NewOrganization, OrganizationRecord, configs, organizations,
};
use crate::tasks::BackgroundTask;

pub async fn create_organization(
    state: &AppState,
    name: &str,
    shared_secret: Option<&str>,
) -> ApiResult<OrganizationRecord> {
    if name.trim().is_empty() {
        return Err(AppError::validation("organization name must not be empty"));
    }
    let secret = match shared_secret {
        Some(secret) if !secret.trim().is_empty() => secret.trim().to_string(),
        Some(_) => return Err(AppError::validation("shared secret must not be empty")),
        None => keys::generate_key(),
    };
    let org = organizations::create_organization(&state.db, NewOrganization::new(name.trim(), secret)).await?;
    info!(organization_id = %org.id, "organization created");
    Ok(org)
}

pub async fn get_organization(state: &AppState, organization_id: Uuid) -> ApiResult<OrganizationRecord> {
    organizations::get_organization(&state.db, organization_id)
        .await?
        .ok_or_else(|| AppError::not_found("organization not found"))
}

/// Replace the settings context. Every config of the organization is
/// re-evaluated in the background.
pub async fn update_context(
    state: &AppState,
    organization_id: Uuid,
    context: ContextVars,
) -> ApiResult<OrganizationRecord> {
    if organizations::update_context(&state.db, organization_id, &context).await? == 0 {
        return Err(AppError::not_found("organization not found"));
    }
    info!(%organization_id, keys = context.len(), "organization context updated");
    state
        .tasks
        .submit(state, BackgroundTask::InvalidateOrganization { organization_id })
        .await;
    get_organization(state, organization_id).await
}

pub async fn update_flags(
    state: &AppState,
    organization_id: Uuid,
    is_active: bool,
    registration_enabled: bool,
) -> ApiResult<OrganizationRecord> {
    if organizations::update_flags(&state.db, organization_id, is_active, registration_enabled).await? == 0 {
        return Err(AppError::not_found("organization not found"));
    }
    get_organization(state, organization_id).await
}

/// Drop the cached checksums of every config in the organization and
/// recompile them.
pub async fn recheck_organization(state: &AppState, organization_id: Uuid) -> crate::Result<()> {
    let filter = ConfigFilter {
        organization_id: Some(organization_id),
        ..ConfigFilter::default()
    };
    let config_ids = configs::list_config_ids(&state.db, &filter).await?;
    state.checksums.invalidate_many(&config_ids).await;
    info!(%organization_id, configs = config_ids.len(), "rechecking organization configs");
    super::configs::recheck_many(state, &config_ids, ModifiedAction::ConfigChanged).await
}
