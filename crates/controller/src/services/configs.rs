//! The config aggregate: every mutation recompiles the config inside its
//! transaction, persists the new checksum and moves the status.

use std::collections::{BTreeSet, HashSet};

use common::api::ConfigStatus;
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::AfterCommit;
use super::compile::{self, Compiled, ConfigSources};
use crate::app_state::AppState;
use crate::backend::CompileError;
use crate::context::{ContextView, ResolvedContext};
use crate::error::{ApiResult, AppError};
use crate::events::{ConfigEvent, ModifiedAction};
use crate::persistence::{
    ConfigContentUpdate, ConfigFilter, ConfigRecord, ContextVars, DeviceRecord, NewConfig,
    TemplateRecord, configs, devices, notifications, templates,
};
use crate::status::{self, TransitionError};

pub const CONFIG_ERROR_KIND: &str = "config_error";

const REQUIRED_REMOVAL: &str = "Required templates cannot be removed from the configuration";

/// Partial update of a config's own content.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub backend: Option<String>,
    pub config: Option<Value>,
    pub context: Option<ContextVars>,
}

/// How a template set change treats required templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequiredPolicy {
    /// Refuse removal; an empty set gets the required templates back.
    Enforce,
    /// Deactivation and backend switches drop everything they are told to.
    Ignore,
}

fn names_for_pointer(pointer: &str, candidates: &[TemplateRecord]) -> Vec<usize> {
    let exact: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, template)| template.config.0.pointer(pointer).is_some())
        .map(|(index, _)| index)
        .collect();
    if !exact.is_empty() {
        return exact;
    }
    let Some(section) = pointer.trim_start_matches('/').split('/').next() else {
        return Vec::new();
    };
    candidates
        .iter()
        .enumerate()
        .filter(|(_, template)| template.config.0.get(section).is_some())
        .map(|(index, _)| index)
        .collect()
}

/// Templates touching any violated path, in attach order.
fn conflict_names(err: &CompileError, candidates: &[TemplateRecord]) -> Vec<String> {
    let offending: BTreeSet<usize> = err
        .violations()
        .iter()
        .flat_map(|violation| names_for_pointer(&violation.path, candidates))
        .collect();
    offending
        .into_iter()
        .map(|index| candidates[index].name.clone())
        .collect()
}

fn template_conflict(err: CompileError, candidates: &[TemplateRecord]) -> AppError {
    if !matches!(err, CompileError::Validation(_)) {
        return err.into();
    }
    let names = conflict_names(&err, candidates);
    let message = if names.is_empty() {
        format!("There is a conflict with the specified templates. {err}")
    } else {
        format!(
            "There is a conflict with the specified templates. Offending templates: {}. {err}",
            names.join(", ")
        )
    };
    AppError::validation(message)
}

fn org_mismatch(candidates: &[TemplateRecord], organization_id: Uuid) -> Option<AppError> {
    let offending: Vec<&str> = candidates
        .iter()
        .filter(|template| !template.usable_by(organization_id))
        .map(|template| template.name.as_str())
        .collect();
    (!offending.is_empty()).then(|| {
        AppError::validation(format!(
            "The following templates are owned by organizations which do not match the \
             organization of this configuration: {}",
            offending.join(", ")
        ))
    })
}

fn dedup_ids(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

async fn load_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    config_id: Uuid,
) -> ApiResult<ConfigSources> {
    compile::load_sources_tx(state, tx, config_id)
        .await?
        .ok_or_else(|| AppError::not_found("configuration not found"))
}

fn reject_deactivated(config: &ConfigRecord) -> ApiResult<()> {
    if config.status.is_deactivation() {
        return Err(AppError::conflict(format!(
            "configuration is {}; activate it before editing",
            config.status
        )));
    }
    Ok(())
}

/// Templates every fresh (or re-activated) config starts with: defaults
/// for the organization and backend, then the device group's templates.
pub(crate) async fn initial_template_ids_tx(
    tx: &mut Transaction<'_, Sqlite>,
    device: &DeviceRecord,
    backend: &str,
) -> crate::Result<Vec<Uuid>> {
    let mut ids: Vec<Uuid> = templates::default_templates_tx(tx, device.organization_id, backend)
        .await?
        .into_iter()
        .map(|template| template.id)
        .collect();
    if let Some(group_id) = device.group_id {
        let group_ids = devices::group_template_ids_tx(tx, group_id).await?;
        let group_templates = templates::get_templates_ordered_tx(tx, &group_ids).await?;
        ids.extend(
            group_templates
                .into_iter()
                .filter(|template| template.backend == backend)
                .filter(|template| template.usable_by(device.organization_id))
                .map(|template| template.id),
        );
    }
    Ok(dedup_ids(ids))
}

/// Validate and store a new template set, then reconcile VPN clients.
/// Does not recompute the checksum.
pub(crate) async fn apply_templates_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    sources: &mut ConfigSources,
    template_ids: Vec<Uuid>,
    policy: RequiredPolicy,
    after: &mut AfterCommit,
) -> ApiResult<bool> {
    let mut template_ids = dedup_ids(template_ids);
    let organization_id = sources.device.organization_id;

    if policy == RequiredPolicy::Enforce {
        if template_ids.is_empty() {
            template_ids = templates::required_templates_tx(tx, organization_id, &sources.config.backend)
                .await?
                .into_iter()
                .map(|template| template.id)
                .collect();
        }
        let kept: HashSet<Uuid> = template_ids.iter().copied().collect();
        let removes_required = sources.templates.iter().any(|template| {
            template.required
                && template.backend == sources.config.backend
                && !kept.contains(&template.id)
        });
        if removes_required {
            return Err(AppError::validation(REQUIRED_REMOVAL));
        }
    }

    let candidates = templates::get_templates_ordered_tx(tx, &template_ids).await?;
    if candidates.len() != template_ids.len() {
        return Err(AppError::not_found("template not found"));
    }
    let current: Vec<Uuid> = sources.templates.iter().map(|template| template.id).collect();
    if current == template_ids {
        return Ok(false);
    }
    if let Some(err) = org_mismatch(&candidates, organization_id) {
        return Err(err);
    }

    let previous = std::mem::replace(&mut sources.templates, candidates);
    if let Err(err) = compile::validate(state, sources) {
        let candidates = std::mem::replace(&mut sources.templates, previous);
        return Err(template_conflict(err, &candidates));
    }

    configs::replace_templates_tx(tx, sources.config.id, &template_ids).await?;
    super::vpn::reconcile_clients_tx(state, tx, sources, after).await?;
    sources.vpn_context = compile::vpn_context_tx(state, tx, sources.config.id).await?;
    after.invalidate(sources.config.id);
    Ok(true)
}

/// Recompile and persist the checksum; a change moves the status through
/// [`status::after_content_change`] and emits `config_modified`.
pub(crate) async fn refresh_checksum_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    sources: &mut ConfigSources,
    action: ModifiedAction,
    after: &mut AfterCommit,
) -> ApiResult<Compiled> {
    let compiled = compile::compile(state, sources)?;
    let config = &mut sources.config;
    after.invalidate(config.id);

    let Some(previous_checksum) = config.checksum.clone() else {
        configs::update_checksum_tx(tx, config.id, &compiled.checksum).await?;
        config.checksum = Some(compiled.checksum.clone());
        return Ok(compiled);
    };
    if previous_checksum == compiled.checksum {
        return Ok(compiled);
    }

    configs::update_checksum_tx(tx, config.id, &compiled.checksum).await?;
    config.checksum = Some(compiled.checksum.clone());

    let previous_status = config.status;
    let next = status::after_content_change(previous_status);
    if next != previous_status {
        configs::update_status_tx(tx, config.id, next, "").await?;
        config.status = next;
        config.error_reason.clear();
        after.event(ConfigEvent::StatusChanged {
            config_id: config.id,
            device_id: config.device_id,
            previous_status,
            status: next,
        });
    }
    after.event(ConfigEvent::ConfigModified {
        config_id: config.id,
        device_id: config.device_id,
        previous_status,
        action,
    });
    Ok(compiled)
}

/// Create the config of a freshly inserted device.
pub(crate) async fn create_config_tx(
    state: &AppState,
    tx: &mut Transaction<'_, Sqlite>,
    device: &DeviceRecord,
    backend: &str,
    config: Value,
    context: ContextVars,
    extra_templates: Vec<Uuid>,
    after: &mut AfterCommit,
) -> ApiResult<Uuid> {
    if !state.backends.contains(backend) {
        return Err(CompileError::UnknownBackend(backend.to_string()).into());
    }
    if !config.is_object() {
        return Err(AppError::validation("config must be a JSON object"));
    }
    let config_id = Uuid::new_v4();
    configs::create_config_tx(
        tx,
        &NewConfig {
            id: config_id,
            device_id: device.id,
            backend: backend.to_string(),
            config,
            context,
        },
    )
    .await?;

    let mut sources = load_tx(state, tx, config_id).await?;
    let mut ids = initial_template_ids_tx(tx, device, backend).await?;
    ids.extend(extra_templates);
    if !ids.is_empty() {
        apply_templates_tx(state, tx, &mut sources, ids, RequiredPolicy::Ignore, after).await?;
    }
    refresh_checksum_tx(state, tx, &mut sources, ModifiedAction::ConfigChanged, after).await?;
    Ok(config_id)
}

pub async fn get_config(state: &AppState, config_id: Uuid) -> ApiResult<ConfigRecord> {
    configs::get_config(&state.db, config_id)
        .await?
        .ok_or_else(|| AppError::not_found("configuration not found"))
}

pub async fn update_config(
    state: &AppState,
    config_id: Uuid,
    update: ConfigUpdate,
) -> ApiResult<ConfigRecord> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let mut sources = load_tx(state, &mut tx, config_id).await?;
    reject_deactivated(&sources.config)?;

    if let Some(document) = &update.config
        && !document.is_object()
    {
        return Err(AppError::validation("config must be a JSON object"));
    }
    let old_backend = sources.config.backend.clone();
    let backend_changed = update
        .backend
        .as_deref()
        .is_some_and(|backend| backend != old_backend);
    if let Some(backend) = update.backend {
        if !state.backends.contains(&backend) {
            return Err(CompileError::UnknownBackend(backend).into());
        }
        sources.config.backend = backend;
    }
    if let Some(document) = update.config {
        sources.config.config.0 = document;
    }
    if let Some(context) = update.context {
        sources.config.context.0 = context;
    }

    configs::update_content_tx(
        &mut tx,
        config_id,
        ConfigContentUpdate {
            backend: &sources.config.backend,
            config: &sources.config.config.0,
            context: &sources.config.context.0,
        },
    )
    .await?;

    if backend_changed {
        let ids = initial_template_ids_tx(&mut tx, &sources.device, &sources.config.backend).await?;
        apply_templates_tx(state, &mut tx, &mut sources, ids, RequiredPolicy::Ignore, &mut after)
            .await?;
        after.event(ConfigEvent::BackendChanged {
            config_id,
            device_id: sources.config.device_id,
            old_backend,
            new_backend: sources.config.backend.clone(),
        });
    }
    refresh_checksum_tx(state, &mut tx, &mut sources, ModifiedAction::ConfigChanged, &mut after)
        .await?;
    tx.commit().await?;
    after.run(state).await;
    info!(%config_id, backend_changed, "config updated");
    get_config(state, config_id).await
}

/// Replace the ordered template set.
pub async fn set_templates(
    state: &AppState,
    config_id: Uuid,
    template_ids: Vec<Uuid>,
) -> ApiResult<Vec<Uuid>> {
    change_templates(state, config_id, |_| template_ids).await
}

/// Append templates, keeping the existing order.
pub async fn attach_templates(
    state: &AppState,
    config_id: Uuid,
    template_ids: Vec<Uuid>,
) -> ApiResult<Vec<Uuid>> {
    change_templates(state, config_id, |current| {
        current.iter().copied().chain(template_ids).collect()
    })
    .await
}

pub async fn detach_templates(
    state: &AppState,
    config_id: Uuid,
    template_ids: Vec<Uuid>,
) -> ApiResult<Vec<Uuid>> {
    let removed: HashSet<Uuid> = template_ids.into_iter().collect();
    change_templates(state, config_id, |current| {
        current.iter().copied().filter(|id| !removed.contains(id)).collect()
    })
    .await
}

async fn change_templates(
    state: &AppState,
    config_id: Uuid,
    next: impl FnOnce(&[Uuid]) -> Vec<Uuid>,
) -> ApiResult<Vec<Uuid>> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let mut sources = load_tx(state, &mut tx, config_id).await?;
    reject_deactivated(&sources.config)?;

    let current: Vec<Uuid> = sources.templates.iter().map(|template| template.id).collect();
    let ids = next(&current);
    let changed =
        apply_templates_tx(state, &mut tx, &mut sources, ids, RequiredPolicy::Enforce, &mut after)
            .await?;
    if changed {
        refresh_checksum_tx(
            state,
            &mut tx,
            &mut sources,
            ModifiedAction::TemplatesChanged,
            &mut after,
        )
        .await?;
    }
    tx.commit().await?;
    after.run(state).await;
    Ok(sources.templates.iter().map(|template| template.id).collect())
}

/// Device status report. Returns the resulting status.
pub async fn report_status(
    state: &AppState,
    config_id: Uuid,
    reported: ConfigStatus,
    error_reason: Option<&str>,
) -> ApiResult<ConfigStatus> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let config = configs::get_config_tx(&mut tx, config_id)
        .await?
        .ok_or_else(|| AppError::not_found("configuration not found"))?;

    let next = status::apply_report(config.status, reported)?;
    let reason = if next == ConfigStatus::Error {
        status::normalize_error_reason(error_reason, state.limits.error_reason_max_len)
    } else {
        String::new()
    };
    configs::update_status_tx(&mut tx, config_id, next, &reason).await?;
    if next != config.status {
        after.event(ConfigEvent::StatusChanged {
            config_id,
            device_id: config.device_id,
            previous_status: config.status,
            status: next,
        });
    }
    tx.commit().await?;
    after.run(state).await;
    Ok(next)
}

/// Clear local config and templates. Moves straight to `deactivated` when
/// the output did not change.
pub async fn deactivate(state: &AppState, config_id: Uuid) -> ApiResult<ConfigStatus> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let mut sources = load_tx(state, &mut tx, config_id).await?;
    let previous_status = sources.config.status;
    if previous_status.is_deactivation() {
        return Ok(previous_status);
    }

    let before = compile::compile(state, &sources)
        .map(|compiled| compiled.checksum)
        .ok()
        .or_else(|| sources.config.checksum.clone());
    sources.config.config.0 = Value::Object(serde_json::Map::new());
    configs::update_content_tx(
        &mut tx,
        config_id,
        ConfigContentUpdate {
            backend: &sources.config.backend,
            config: &sources.config.config.0,
            context: &sources.config.context.0,
        },
    )
    .await?;
    apply_templates_tx(state, &mut tx, &mut sources, Vec::new(), RequiredPolicy::Ignore, &mut after)
        .await?;

    let compiled = compile::compile(state, &sources)?;
    configs::update_checksum_tx(&mut tx, config_id, &compiled.checksum).await?;
    configs::update_deactivated_checksum_tx(&mut tx, config_id, Some(&compiled.checksum)).await?;
    let next = if before.as_deref() == Some(compiled.checksum.as_str()) {
        ConfigStatus::Deactivated
    } else {
        ConfigStatus::Deactivating
    };
    configs::update_status_tx(&mut tx, config_id, next, "").await?;
    after.invalidate(config_id);
    after.event(ConfigEvent::StatusChanged {
        config_id,
        device_id: sources.config.device_id,
        previous_status,
        status: next,
    });
    tx.commit().await?;
    after.run(state).await;
    info!(%config_id, status = %next, "config deactivated");
    Ok(next)
}

/// Operator-side confirmation that a device dropped its configuration.
pub async fn confirm_deactivation(state: &AppState, config_id: Uuid) -> ApiResult<ConfigStatus> {
    report_status(state, config_id, ConfigStatus::Deactivated, None).await
}

/// Re-attach default, required and group templates to a deactivated
/// config. Returns to `applied` when the output equals the baseline the
/// device already runs.
pub async fn activate(state: &AppState, config_id: Uuid) -> ApiResult<ConfigStatus> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let mut sources = load_tx(state, &mut tx, config_id).await?;
    let previous_status = sources.config.status;
    if previous_status != ConfigStatus::Deactivated {
        return Err(TransitionError::NotAllowed {
            from: previous_status,
            to: ConfigStatus::Modified,
        }
        .into());
    }

    let ids = initial_template_ids_tx(&mut tx, &sources.device, &sources.config.backend).await?;
    apply_templates_tx(state, &mut tx, &mut sources, ids, RequiredPolicy::Ignore, &mut after).await?;
    let compiled = compile::compile(state, &sources)?;
    let next = if sources.config.deactivated_checksum.as_deref() == Some(compiled.checksum.as_str()) {
        ConfigStatus::Applied
    } else {
        ConfigStatus::Modified
    };
    configs::update_checksum_tx(&mut tx, config_id, &compiled.checksum).await?;
    configs::update_deactivated_checksum_tx(&mut tx, config_id, None).await?;
    configs::update_status_tx(&mut tx, config_id, next, "").await?;
    after.invalidate(config_id);
    after.event(ConfigEvent::StatusChanged {
        config_id,
        device_id: sources.config.device_id,
        previous_status,
        status: next,
    });
    tx.commit().await?;
    after.run(state).await;
    info!(%config_id, status = %next, "config activated");
    Ok(next)
}

/// Drop one template from a config regardless of its flags; used when the
/// template itself goes away.
pub(crate) async fn remove_template(
    state: &AppState,
    config_id: Uuid,
    template_id: Uuid,
) -> ApiResult<()> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let mut sources = load_tx(state, &mut tx, config_id).await?;
    let ids: Vec<Uuid> = sources
        .templates
        .iter()
        .map(|template| template.id)
        .filter(|id| *id != template_id)
        .collect();
    let changed =
        apply_templates_tx(state, &mut tx, &mut sources, ids, RequiredPolicy::Ignore, &mut after)
            .await?;
    if changed {
        refresh_checksum_tx(
            state,
            &mut tx,
            &mut sources,
            ModifiedAction::TemplatesChanged,
            &mut after,
        )
        .await?;
    }
    tx.commit().await?;
    after.run(state).await;
    Ok(())
}

/// Recompile after an input outside the config row changed. Returns
/// whether the checksum moved.
pub async fn recheck(state: &AppState, config_id: Uuid, action: ModifiedAction) -> ApiResult<bool> {
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let mut sources = load_tx(state, &mut tx, config_id).await?;
    let before = sources.config.checksum.clone();
    super::vpn::reconcile_clients_tx(state, &mut tx, &sources, &mut after).await?;
    sources.vpn_context = compile::vpn_context_tx(state, &mut tx, config_id).await?;
    let compiled = refresh_checksum_tx(state, &mut tx, &mut sources, action, &mut after).await?;
    tx.commit().await?;
    after.run(state).await;
    Ok(before.as_deref() != Some(compiled.checksum.as_str()))
}

/// Best-effort recheck of many configs. Configs that no longer compile get
/// a device notification; other failures are returned after the loop so
/// the task is retried.
pub async fn recheck_many(
    state: &AppState,
    config_ids: &[Uuid],
    action: ModifiedAction,
) -> crate::Result<()> {
    let mut first_failure = None;
    for &config_id in config_ids {
        match recheck(state, config_id, action).await {
            Ok(_) => {}
            Err(err) if err.code == "validation_error" => {
                warn!(%config_id, error = %err.message, "config no longer compiles");
                let device_id = configs::get_config(&state.db, config_id)
                    .await?
                    .map(|config| config.device_id);
                notifications::insert_notification(
                    &state.db,
                    device_id,
                    "error",
                    CONFIG_ERROR_KIND,
                    &err.message,
                )
                .await?;
            }
            Err(err) if err.code == "not_found" => {}
            Err(err) => {
                warn!(%config_id, %err, "config recheck failed");
                first_failure.get_or_insert(err);
            }
        }
    }
    match first_failure {
        Some(err) => Err(anyhow::Error::new(err)),
        None => Ok(()),
    }
}

/// Current checksum, served from the cache when possible.
pub async fn checksum(state: &AppState, config_id: Uuid) -> ApiResult<String> {
    if let Some(cached) = state.checksums.get(config_id).await {
        return Ok(cached);
    }
    let ticket = state.checksums.ticket().await;
    let sources = compile::load_sources(state, config_id)
        .await?
        .ok_or_else(|| AppError::not_found("configuration not found"))?;
    let compiled = compile::compile(state, &sources)?;
    state
        .checksums
        .put(ticket, config_id, compiled.checksum.clone())
        .await;
    Ok(compiled.checksum)
}

/// Variables derived for a config from its device, organization, group,
/// VPN clients and context functions, leaving out per-device overrides.
pub async fn system_context(state: &AppState, config_id: Uuid) -> ApiResult<ResolvedContext> {
    let sources = compile::load_sources(state, config_id)
        .await?
        .ok_or_else(|| AppError::not_found("configuration not found"))?;
    Ok(compile::resolve_context(state, &sources, ContextView::System))
}

/// Package a device downloads, with its file name.
pub async fn download(state: &AppState, config_id: Uuid) -> ApiResult<(String, Vec<u8>)> {
    let ticket = state.checksums.ticket().await;
    let sources = compile::load_sources(state, config_id)
        .await?
        .ok_or_else(|| AppError::not_found("configuration not found"))?;
    let compiled = compile::compile(state, &sources)?;
    state.checksums.put(ticket, config_id, compiled.checksum).await;
    Ok((format!("{}.tar.gz", sources.device.name), compiled.archive))
}

/// Drop cached checksums for every config matching `filter`.
pub async fn invalidate_filtered(state: &AppState, filter: &ConfigFilter) -> crate::Result<usize> {
    let ids = configs::list_config_ids(&state.db, filter).await?;
    state.checksums.invalidate_many(&ids).await;
    info!(count = ids.len(), "invalidated cached checksums");
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::templates::TemplateInput;
    use crate::services::test_support::{self, setup_state, setup_state_with_events};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn fresh_config_is_modified_and_edits_after_apply_return_to_modified() {
        let (state, log) = setup_state_with_events().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let config = get_config(&state, config_id).await.expect("config");
        assert_eq!(config.status, ConfigStatus::Modified);
        assert!(config.checksum.is_some());

        let status = report_status(&state, config_id, ConfigStatus::Applied, None)
            .await
            .expect("report");
        assert_eq!(status, ConfigStatus::Applied);
        log.clear();

        let updated = update_config(
            &state,
            config_id,
            ConfigUpdate {
                config: Some(json!({"general": {"timezone": "UTC"}})),
                ..ConfigUpdate::default()
            },
        )
        .await
        .expect("update");
        assert_eq!(updated.status, ConfigStatus::Modified);
        assert_ne!(updated.checksum, config.checksum);

        let events = log.snapshot();
        assert!(events.iter().any(|event| matches!(
            event,
            ConfigEvent::ConfigModified {
                previous_status: ConfigStatus::Applied,
                action: ModifiedAction::ConfigChanged,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn saving_identical_content_keeps_status() {
        let (state, log) = setup_state_with_events().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        report_status(&state, config_id, ConfigStatus::Applied, None)
            .await
            .expect("report");
        log.clear();

        let updated = update_config(&state, config_id, ConfigUpdate::default())
            .await
            .expect("update");
        assert_eq!(updated.status, ConfigStatus::Applied);
        assert!(recheck(&state, config_id, ModifiedAction::ConfigChanged).await.is_ok());
        assert!(!log.snapshot().iter().any(|event| matches!(
            event,
            ConfigEvent::ConfigModified { .. } | ConfigEvent::StatusChanged { .. }
        )));
    }

    #[tokio::test]
    async fn unchanged_output_on_a_modified_config_is_silent() {
        let (state, log) = setup_state_with_events().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        log.clear();

        let moved = recheck(&state, config_id, ModifiedAction::ConfigChanged)
            .await
            .expect("recheck");
        assert!(!moved);
        assert_eq!(get_config(&state, config_id).await.expect("config").status, ConfigStatus::Modified);
        assert!(log.snapshot().is_empty());
    }

    #[tokio::test]
    async fn edit_on_modified_config_still_emits_content_event() {
        let (state, log) = setup_state_with_events().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        log.clear();

        update_config(
            &state,
            config_id,
            ConfigUpdate {
                config: Some(json!({"dns_servers": ["9.9.9.9"]})),
                ..ConfigUpdate::default()
            },
        )
        .await
        .expect("update");

        let events = log.snapshot();
        assert!(!events.iter().any(|event| matches!(event, ConfigEvent::StatusChanged { .. })));
        assert!(events.iter().any(|event| matches!(
            event,
            ConfigEvent::ConfigModified { previous_status: ConfigStatus::Modified, .. }
        )));
    }

    #[tokio::test]
    async fn error_report_stores_bounded_reason() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let long = "e".repeat(3000);
        report_status(&state, config_id, ConfigStatus::Error, Some(&long))
            .await
            .expect("report");
        let config = get_config(&state, config_id).await.expect("config");
        assert_eq!(config.status, ConfigStatus::Error);
        assert_eq!(config.error_reason.chars().count(), 1024);

        report_status(&state, config_id, ConfigStatus::Applied, None)
            .await
            .expect("report");
        let config = get_config(&state, config_id).await.expect("config");
        assert!(config.error_reason.is_empty());
    }

    #[tokio::test]
    async fn deactivating_an_empty_config_is_immediate() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let status = deactivate(&state, config_id).await.expect("deactivate");
        assert_eq!(status, ConfigStatus::Deactivated);
    }

    #[tokio::test]
    async fn deactivation_round_trip_with_content() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        let template = test_support::template(
            &state,
            Some(org.id),
            "dns",
            json!({"dns_servers": ["1.1.1.1"]}),
        )
        .await;
        attach_templates(&state, config_id, vec![template.id])
            .await
            .expect("attach");

        let status = deactivate(&state, config_id).await.expect("deactivate");
        assert_eq!(status, ConfigStatus::Deactivating);
        assert!(
            update_config(&state, config_id, ConfigUpdate::default())
                .await
                .is_err()
        );

        let status = confirm_deactivation(&state, config_id).await.expect("confirm");
        assert_eq!(status, ConfigStatus::Deactivated);

        let status = activate(&state, config_id).await.expect("activate");
        assert_eq!(status, ConfigStatus::Applied);
        assert!(configs::template_ids(&state.db, config_id).await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn device_can_fail_while_deactivating() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        let template = test_support::template(
            &state,
            Some(org.id),
            "dns",
            json!({"dns_servers": ["1.1.1.1"]}),
        )
        .await;
        attach_templates(&state, config_id, vec![template.id])
            .await
            .expect("attach");
        assert_eq!(
            deactivate(&state, config_id).await.expect("deactivate"),
            ConfigStatus::Deactivating
        );

        let status = report_status(&state, config_id, ConfigStatus::Error, Some("uci commit failed"))
            .await
            .expect("report");
        assert_eq!(status, ConfigStatus::Error);
        let config = get_config(&state, config_id).await.expect("config");
        assert_eq!(config.error_reason, "uci commit failed");
    }

    #[tokio::test]
    async fn activation_reattaches_defaults() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        deactivate(&state, config_id).await.expect("deactivate");

        let default = test_support::default_template(
            &state,
            Some(org.id),
            "ntp",
            json!({"general": {"timezone": "UTC"}}),
            false,
        )
        .await;
        let status = activate(&state, config_id).await.expect("activate");
        assert_eq!(status, ConfigStatus::Modified);
        assert_eq!(
            configs::template_ids(&state.db, config_id).await.expect("ids"),
            vec![default.id]
        );
    }

    #[tokio::test]
    async fn required_templates_cannot_be_detached() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let required = test_support::default_template(
            &state,
            None,
            "baseline",
            json!({"dns_servers": ["1.1.1.1"]}),
            true,
        )
        .await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        assert_eq!(
            configs::template_ids(&state.db, config_id).await.expect("ids"),
            vec![required.id]
        );

        let err = detach_templates(&state, config_id, vec![required.id])
            .await
            .expect_err("required");
        assert_eq!(err.message, REQUIRED_REMOVAL);

        let ids = set_templates(&state, config_id, Vec::new()).await.expect("clear");
        assert_eq!(ids, vec![required.id]);
    }

    #[tokio::test]
    async fn templates_of_other_organizations_are_rejected() {
        let state = setup_state().await;
        let acme = test_support::organization(&state, "acme").await;
        let other = test_support::organization(&state, "other").await;
        let foreign = test_support::template(&state, Some(other.id), "foreign", json!({})).await;
        let device = test_support::device(&state, acme.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let err = attach_templates(&state, config_id, vec![foreign.id])
            .await
            .expect_err("mismatch");
        assert!(err.message.starts_with(
            "The following templates are owned by organizations which do not match"
        ));
        assert!(err.message.ends_with("foreign"));
    }

    #[tokio::test]
    async fn conflicting_templates_are_named() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        let good = test_support::template(&state, Some(org.id), "good", json!({"dns_servers": ["1.1.1.1"]})).await;
        let mut input = TemplateInput::generic(
            Some(org.id),
            "uplink",
            "netjson",
            json!({"interfaces": [{"name": "{{ uplink_interface }}"}]}),
        );
        input.default_values.insert("uplink_interface".into(), json!("eth0"));
        let bad = crate::services::templates::create_template(&state, input)
            .await
            .expect("valid on its own");

        let err = attach_templates(&state, config_id, vec![good.id, bad.id])
            .await
            .expect_err("conflict");
        assert!(err.message.starts_with("There is a conflict with the specified templates."));
        assert!(err.message.contains("Offending templates: uplink."));
        assert!(!err.message.contains("good"));
        assert!(configs::template_ids(&state.db, config_id).await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn every_conflicting_template_is_named() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        let good = test_support::template(&state, Some(org.id), "good", json!({"dns_servers": ["1.1.1.1"]})).await;

        let mut uplink = TemplateInput::generic(
            Some(org.id),
            "uplink",
            "netjson",
            json!({"interfaces": [{"name": "{{ uplink_interface }}"}]}),
        );
        uplink.default_values.insert("uplink_interface".into(), json!("eth0"));
        let uplink = crate::services::templates::create_template(&state, uplink)
            .await
            .expect("valid on its own");

        let mut motd = TemplateInput::generic(
            Some(org.id),
            "motd",
            "netjson",
            json!({"files": [{"path": "/etc/motd", "mode": "{{ file_mode }}", "contents": "hi"}]}),
        );
        motd.default_values.insert("file_mode".into(), json!("0644"));
        let motd = crate::services::templates::create_template(&state, motd)
            .await
            .expect("valid on its own");

        let err = attach_templates(&state, config_id, vec![good.id, uplink.id, motd.id])
            .await
            .expect_err("conflict");
        assert!(err.message.contains("Offending templates: uplink, motd."));
        assert!(err.message.contains("\"#/interfaces/0/name\""));
        assert!(err.message.contains("\"#/files/0/mode\""));
        assert!(!err.message.contains("good"));
    }

    #[tokio::test]
    async fn backend_change_emits_dedicated_event() {
        let (state, log) = setup_state_with_events().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        log.clear();

        update_config(
            &state,
            config_id,
            ConfigUpdate {
                backend: Some("openwrt".into()),
                ..ConfigUpdate::default()
            },
        )
        .await
        .expect("update");
        assert!(log.snapshot().iter().any(|event| matches!(
            event,
            ConfigEvent::BackendChanged { old_backend, new_backend, .. }
                if old_backend == "netjson" && new_backend == "openwrt"
        )));
    }

    #[tokio::test]
    async fn system_context_leaves_out_device_overrides() {
        let mut state = setup_state().await;
        let mut functions = crate::context::ContextFunctions::new();
        functions.register(
            "site",
            Arc::new(|device: &DeviceRecord| {
                ContextVars::from([("site".to_string(), json!(format!("site-{}", device.name)))])
            }),
        );
        state.context = Arc::new(crate::context::ContextResolver::new(
            ContextVars::new(),
            functions,
            false,
        ));
        let org = test_support::organization(&state, "acme").await;
        crate::services::organizations::update_context(
            &state,
            org.id,
            ContextVars::from([("ntp".to_string(), json!("pool.ntp.org"))]),
        )
        .await
        .expect("org context");
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        update_config(
            &state,
            config_id,
            ConfigUpdate {
                context: Some(ContextVars::from([("ntp".to_string(), json!("10.0.0.1"))])),
                ..ConfigUpdate::default()
            },
        )
        .await
        .expect("override");

        let context = system_context(&state, config_id).await.expect("context");
        assert_eq!(context.text("ntp").as_deref(), Some("pool.ntp.org"));
        assert_eq!(context.text("site").as_deref(), Some("site-router-1"));
        assert_eq!(context.text("name").as_deref(), Some("router-1"));
    }

    #[tokio::test]
    async fn checksum_is_cached_until_invalidated() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;

        let first = checksum(&state, config_id).await.expect("checksum");
        assert_eq!(state.checksums.get(config_id).await, Some(first.clone()));

        let count = invalidate_filtered(
            &state,
            &ConfigFilter {
                organization_id: Some(org.id),
                ..ConfigFilter::default()
            },
        )
        .await
        .expect("invalidate");
        assert_eq!(count, 1);
        assert!(state.checksums.get(config_id).await.is_none());
    }
}
