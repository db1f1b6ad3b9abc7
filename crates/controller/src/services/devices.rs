//! Device creation, self-registration and the device edits that feed the
//! compiled config (name, inventory, group).

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::AfterCommit;
use super::compile;
use super::configs::{self as config_service, RequiredPolicy};
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::events::{ConfigEvent, ModifiedAction};
use crate::keys;
use crate::metrics::record_registration;
use crate::persistence::{
    ContextVars, DeviceInventoryUpdate, DeviceRecord, NewDevice, OrganizationRecord, configs,
    devices, organizations, templates,
};

#[derive(Debug, Clone)]
pub struct DeviceInput {
    pub organization_id: Uuid,
    pub group_id: Option<Uuid>,
    pub name: String,
    pub mac_address: String,
    /// Generated when absent.
    pub key: Option<String>,
    pub hardware_id: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub system: Option<String>,
    pub backend: String,
    pub config: Value,
    pub context: ContextVars,
}

impl DeviceInput {
    pub fn new(
        organization_id: Uuid,
        name: impl Into<String>,
        mac_address: impl Into<String>,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            organization_id,
            group_id: None,
            name: name.into(),
            mac_address: mac_address.into(),
            key: None,
            hardware_id: None,
            model: None,
            os: None,
            system: None,
            backend: backend.into(),
            config: Value::Object(serde_json::Map::new()),
            context: ContextVars::new(),
        }
    }
}

/// Parameters of `POST /register/`.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub secret: String,
    pub name: String,
    pub mac_address: String,
    pub backend: String,
    pub key: Option<String>,
    pub hardware_id: Option<String>,
    pub tags: Vec<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub system: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub device: DeviceRecord,
    pub is_new: bool,
}

fn mac_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:(?:[0-9A-Fa-f]{2}:){5}|(?:[0-9A-Fa-f]{2}-){5}|(?:[0-9A-Fa-f]{2}){5})[0-9A-Fa-f]{2}$",
        )
        .expect("mac address pattern is valid")
    })
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{1,64}$").expect("key pattern is valid"))
}

/// Canonical `AA:BB:CC:DD:EE:FF` form.
pub fn normalize_mac(raw: &str) -> ApiResult<String> {
    let raw = raw.trim();
    if !mac_pattern().is_match(raw) {
        return Err(AppError::validation(format!("invalid mac address: {raw:?}")));
    }
    let hex: String = raw.chars().filter(char::is_ascii_hexdigit).collect();
    let pairs: Vec<String> = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_ascii_uppercase())
        .collect();
    Ok(pairs.join(":"))
}

fn validate_name(state: &AppState, name: &str) -> ApiResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::validation("device name must not be empty"));
    }
    if name.chars().count() > state.limits.max_field_len {
        return Err(AppError::validation(format!(
            "device name must be at most {} characters",
            state.limits.max_field_len
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> ApiResult<()> {
    if !key_pattern().is_match(key) {
        return Err(AppError::validation(
            "device key must be 1 to 64 alphanumeric characters",
        ));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub async fn get_device(state: &AppState, device_id: Uuid) -> ApiResult<DeviceRecord> {
    devices::get_device(&state.db, device_id)
        .await?
        .ok_or_else(|| AppError::not_found("device not found"))
}

async fn insert_device(
    state: &AppState,
    input: DeviceInput,
    extra_templates: Vec<Uuid>,
) -> ApiResult<(DeviceRecord, Uuid)> {
    validate_name(state, &input.name)?;
    let mac_address = normalize_mac(&input.mac_address)?;
    let key = match input.key {
        Some(key) => {
            validate_key(&key)?;
            key
        }
        None => keys::generate_key(),
    };
    if !state.backends.contains(&input.backend) {
        return Err(AppError::validation(format!("unknown backend: {}", input.backend)));
    }
    if devices::find_by_mac_address(&state.db, input.organization_id, &mac_address)
        .await?
        .is_some()
    {
        return Err(AppError::validation(format!(
            "a device with mac address {mac_address} already exists"
        )));
    }
    if let Some(group_id) = input.group_id {
        let group = devices::get_group(&state.db, group_id)
            .await?
            .ok_or_else(|| AppError::not_found("device group not found"))?;
        if group.organization_id != input.organization_id {
            return Err(AppError::validation(
                "device group belongs to another organization",
            ));
        }
    }

    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let new_device = NewDevice {
        id: Uuid::new_v4(),
        organization_id: input.organization_id,
        group_id: input.group_id,
        name: input.name.trim().to_string(),
        mac_address,
        key,
        hardware_id: non_empty(input.hardware_id),
        model: non_empty(input.model),
        os: non_empty(input.os),
        system: non_empty(input.system),
    };
    devices::create_device_tx(&mut tx, &new_device).await?;
    let device = devices::get_device_tx(&mut tx, new_device.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("device insert did not return row"))?;
    let config_id = config_service::create_config_tx(
        state,
        &mut tx,
        &device,
        &input.backend,
        input.config,
        input.context,
        extra_templates,
        &mut after,
    )
    .await?;
    tx.commit().await?;
    after.run(state).await;
    info!(device_id = %device.id, %config_id, "device created");
    Ok((device, config_id))
}

/// Create a device and its config.
pub async fn create_device(state: &AppState, input: DeviceInput) -> ApiResult<(DeviceRecord, Uuid)> {
    if organizations::get_organization(&state.db, input.organization_id)
        .await?
        .is_none()
    {
        return Err(AppError::not_found("organization not found"));
    }
    insert_device(state, input, Vec::new()).await
}

fn registration_key(state: &AppState, registration: &Registration) -> Option<String> {
    if !state.registration.consistent {
        return None;
    }
    if let Some(key) = registration.key.as_deref().filter(|key| !key.is_empty()) {
        return Some(key.to_string());
    }
    let identity = registration
        .hardware_id
        .as_deref()
        .filter(|id| !id.is_empty() && state.context.hardware_id_enabled())
        .unwrap_or(&registration.mac_address);
    Some(keys::consistent_key(identity, &registration.secret))
}

async fn registering_organization(
    state: &AppState,
    secret: &str,
) -> ApiResult<OrganizationRecord> {
    let organization = organizations::find_by_shared_secret(&state.db, secret)
        .await?
        .filter(|org| org.is_active)
        .ok_or_else(|| AppError::forbidden("unrecognized secret"))?;
    if !organization.registration_enabled {
        return Err(AppError::forbidden("registration disabled"));
    }
    Ok(organization)
}

/// Device self-registration. A device already known by its key (or by its
/// mac address when keys are not consistent) only refreshes its inventory
/// fields.
pub async fn register(state: &AppState, registration: Registration) -> ApiResult<RegistrationOutcome> {
    if !state.registration.enabled {
        return Err(AppError::forbidden("registration disabled"));
    }
    if !state.backends.contains(&registration.backend) {
        return Err(AppError::forbidden("wrong backend"));
    }
    let organization = registering_organization(state, &registration.secret).await?;
    let key = registration_key(state, &registration);

    let existing = match key.as_deref() {
        Some(key) => devices::find_by_key(&state.db, organization.id, key).await?,
        None => {
            let mac_address = normalize_mac(&registration.mac_address)?;
            devices::find_by_mac_address(&state.db, organization.id, &mac_address).await?
        }
    };

    let outcome = match existing {
        Some(device) => {
            let device = update_inventory(
                state,
                device.id,
                DeviceInventoryUpdate {
                    name: None,
                    model: registration.model.clone(),
                    os: registration.os.clone(),
                    system: registration.system.clone(),
                },
            )
            .await?;
            attach_tagged(state, &device, &registration.tags).await?;
            RegistrationOutcome { device, is_new: false }
        }
        None if !state.registration.self_creation => {
            return Err(AppError::not_found(
                "Device not found in the system, please create it first.",
            ));
        }
        None => {
            let mut tx = state.db.begin().await?;
            let tagged: Vec<Uuid> = templates::templates_with_tags_tx(
                &mut tx,
                organization.id,
                &registration.backend,
                &registration.tags,
            )
            .await?
            .into_iter()
            .map(|template| template.id)
            .collect();
            tx.commit().await?;

            let input = DeviceInput {
                organization_id: organization.id,
                group_id: None,
                name: registration.name,
                mac_address: registration.mac_address,
                key,
                hardware_id: registration.hardware_id,
                model: registration.model,
                os: registration.os,
                system: registration.system,
                backend: registration.backend,
                config: Value::Object(serde_json::Map::new()),
                context: ContextVars::new(),
            };
            let (device, _) = insert_device(state, input, tagged).await?;
            RegistrationOutcome { device, is_new: true }
        }
    };

    state
        .events
        .emit(ConfigEvent::DeviceRegistered {
            device_id: outcome.device.id,
            is_new: outcome.is_new,
        })
        .await;
    record_registration(outcome.is_new);
    info!(device_id = %outcome.device.id, is_new = outcome.is_new, "device registered");
    Ok(outcome)
}

async fn attach_tagged(state: &AppState, device: &DeviceRecord, tags: &[String]) -> ApiResult<()> {
    if tags.is_empty() {
        return Ok(());
    }
    let Some(config) = configs::get_config_for_device(&state.db, device.id).await? else {
        return Ok(());
    };
    let mut tx = state.db.begin().await?;
    let tagged: Vec<Uuid> =
        templates::templates_with_tags_tx(&mut tx, device.organization_id, &config.backend, tags)
            .await?
            .into_iter()
            .map(|template| template.id)
            .collect();
    tx.commit().await?;
    if !tagged.is_empty() {
        config_service::attach_templates(state, config.id, tagged).await?;
    }
    Ok(())
}

/// Store an inventory edit and recompile the config in the same
/// transaction; name and os both feed the compiled output.
async fn edit_inventory(
    state: &AppState,
    device_id: Uuid,
    update: DeviceInventoryUpdate,
) -> ApiResult<DeviceRecord> {
    let config = configs::get_config_for_device(&state.db, device_id).await?;
    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    if devices::update_inventory_tx(&mut tx, device_id, &update).await? == 0 {
        return Err(AppError::not_found("device not found"));
    }
    if let Some(config) = config
        && let Some(mut sources) = compile::load_sources_tx(state, &mut tx, config.id).await?
    {
        config_service::refresh_checksum_tx(
            state,
            &mut tx,
            &mut sources,
            ModifiedAction::ConfigChanged,
            &mut after,
        )
        .await?;
    }
    tx.commit().await?;
    after.run(state).await;
    get_device(state, device_id).await
}

/// Rename a device; the name feeds the hostname and the `name` variable.
pub async fn rename_device(state: &AppState, device_id: Uuid, name: &str) -> ApiResult<DeviceRecord> {
    validate_name(state, name)?;
    let update = DeviceInventoryUpdate {
        name: Some(name.trim().to_string()),
        ..DeviceInventoryUpdate::default()
    };
    let device = edit_inventory(state, device_id, update).await?;
    info!(%device_id, name = %device.name, "device renamed");
    Ok(device)
}

/// Refresh model, os and system; blank values are ignored.
pub async fn update_inventory(
    state: &AppState,
    device_id: Uuid,
    update: DeviceInventoryUpdate,
) -> ApiResult<DeviceRecord> {
    let update = DeviceInventoryUpdate {
        name: None,
        model: non_empty(update.model),
        os: non_empty(update.os),
        system: non_empty(update.system),
    };
    for value in [&update.model, &update.os, &update.system].into_iter().flatten() {
        if value.chars().count() > state.limits.max_field_len {
            return Err(AppError::validation(format!(
                "inventory values must be at most {} characters",
                state.limits.max_field_len
            )));
        }
    }
    edit_inventory(state, device_id, update).await
}

/// Move a device to another group (or none), swapping the old group's
/// templates for the new group's. Required templates stay attached.
pub async fn change_group(
    state: &AppState,
    device_id: Uuid,
    group_id: Option<Uuid>,
) -> ApiResult<DeviceRecord> {
    let device = get_device(state, device_id).await?;
    if device.group_id == group_id {
        return Ok(device);
    }
    if let Some(group_id) = group_id {
        let group = devices::get_group(&state.db, group_id)
            .await?
            .ok_or_else(|| AppError::not_found("device group not found"))?;
        if group.organization_id != device.organization_id {
            return Err(AppError::validation(
                "device group belongs to another organization",
            ));
        }
    }
    let config = configs::get_config_for_device(&state.db, device_id).await?;

    let mut after = AfterCommit::new();
    let mut tx = state.db.begin().await?;
    let old_group_templates = match device.group_id {
        Some(old) => devices::group_template_ids_tx(&mut tx, old).await?,
        None => Vec::new(),
    };
    devices::set_group_tx(&mut tx, device_id, group_id).await?;

    if let Some(config) = config
        && let Some(mut sources) = compile::load_sources_tx(state, &mut tx, config.id).await?
    {
        if !sources.config.status.is_deactivation() {
            let mut ids: Vec<Uuid> = sources
                .templates
                .iter()
                .filter(|template| template.required || !old_group_templates.contains(&template.id))
                .map(|template| template.id)
                .collect();
            if let Some(group_id) = group_id {
                let new_ids = devices::group_template_ids_tx(&mut tx, group_id).await?;
                let candidates = templates::get_templates_ordered_tx(&mut tx, &new_ids).await?;
                ids.extend(
                    candidates
                        .into_iter()
                        .filter(|template| template.backend == sources.config.backend)
                        .filter(|template| template.usable_by(device.organization_id))
                        .map(|template| template.id),
                );
            }
            config_service::apply_templates_tx(
                state,
                &mut tx,
                &mut sources,
                ids,
                RequiredPolicy::Ignore,
                &mut after,
            )
            .await?;
        }
        config_service::refresh_checksum_tx(
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
    info!(%device_id, group_id = ?group_id, "device group changed");
    get_device(state, device_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConfigEvent;
    use crate::services::test_support::{self, setup_state, setup_state_with_events};
    use serde_json::json;

    fn registration(org: &OrganizationRecord, mac: &str) -> Registration {
        Registration {
            secret: org.shared_secret.clone(),
            name: "router-1".into(),
            mac_address: mac.into(),
            backend: "netjson".into(),
            ..Registration::default()
        }
    }

    #[test]
    fn mac_addresses_are_normalized() {
        assert_eq!(normalize_mac("00-11-22-aa-bb-cc").expect("mac"), "00:11:22:AA:BB:CC");
        assert_eq!(normalize_mac("001122aabbcc").expect("mac"), "00:11:22:AA:BB:CC");
        assert!(normalize_mac("00:11:22:aa-bb:cc").is_err());
        assert!(normalize_mac("not-a-mac").is_err());
    }

    #[tokio::test]
    async fn registration_creates_device_once_with_consistent_key() {
        let (state, log) = setup_state_with_events().await;
        let org = test_support::organization(&state, "acme").await;

        let first = register(&state, registration(&org, "00:11:22:33:44:55"))
            .await
            .expect("register");
        assert!(first.is_new);
        assert_eq!(
            first.device.key,
            keys::consistent_key("00:11:22:33:44:55", &org.shared_secret)
        );

        let mut again = registration(&org, "00:11:22:33:44:55");
        again.os = Some("OpenWrt 23.05".into());
        let second = register(&state, again).await.expect("register");
        assert!(!second.is_new);
        assert_eq!(second.device.id, first.device.id);
        assert_eq!(second.device.os.as_deref(), Some("OpenWrt 23.05"));

        let registered: Vec<bool> = log
            .snapshot()
            .into_iter()
            .filter_map(|event| match event {
                ConfigEvent::DeviceRegistered { is_new, .. } => Some(is_new),
                _ => None,
            })
            .collect();
        assert_eq!(registered, vec![true, false]);
    }

    #[tokio::test]
    async fn registration_without_consistent_keys_matches_by_mac() {
        let mut state = setup_state().await;
        state.registration.consistent = false;
        let org = test_support::organization(&state, "acme").await;

        let first = register(&state, registration(&org, "00:11:22:33:44:55"))
            .await
            .expect("register");
        assert!(first.is_new);

        let second = register(&state, registration(&org, "00-11-22-33-44-55"))
            .await
            .expect("register again");
        assert!(!second.is_new);
        assert_eq!(second.device.id, first.device.id);
        assert_eq!(second.device.key, first.device.key);
    }

    #[tokio::test]
    async fn registration_rejects_unknown_secret_and_disabled_orgs() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;

        let mut wrong = registration(&org, "00:11:22:33:44:55");
        wrong.secret = "nope".into();
        let err = register(&state, wrong).await.expect_err("secret");
        assert_eq!(err.message, "unrecognized secret");

        organizations::update_flags(&state.db, org.id, true, false)
            .await
            .expect("flags");
        let err = register(&state, registration(&org, "00:11:22:33:44:55"))
            .await
            .expect_err("disabled");
        assert_eq!(err.message, "registration disabled");
    }

    #[tokio::test]
    async fn unknown_device_is_not_created_without_self_creation() {
        let mut state = setup_state().await;
        state.registration.self_creation = false;
        let org = test_support::organization(&state, "acme").await;

        let err = register(&state, registration(&org, "00:11:22:33:44:55"))
            .await
            .expect_err("not found");
        assert_eq!(err.status, axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registration_tags_attach_matching_templates() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let tagged = test_support::tagged_template(&state, Some(org.id), "mesh", &["mesh"]).await;
        test_support::tagged_template(&state, Some(org.id), "lab", &["lab"]).await;

        let mut form = registration(&org, "00:11:22:33:44:55");
        form.tags = vec!["mesh".into()];
        let outcome = register(&state, form).await.expect("register");

        let config = configs::get_config_for_device(&state.db, outcome.device.id)
            .await
            .expect("db")
            .expect("config");
        assert_eq!(
            configs::template_ids(&state.db, config.id).await.expect("ids"),
            vec![tagged.id]
        );
    }

    #[tokio::test]
    async fn renaming_changes_the_checksum() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        let before = config_service::get_config(&state, config_id).await.expect("config");

        rename_device(&state, device.id, "router-2").await.expect("rename");
        let after = config_service::get_config(&state, config_id).await.expect("config");
        assert_ne!(before.checksum, after.checksum);
    }

    #[tokio::test]
    async fn group_change_swaps_group_templates() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let a = test_support::template(&state, Some(org.id), "a", json!({"dns_servers": ["1.1.1.1"]})).await;
        let b = test_support::template(&state, Some(org.id), "b", json!({"dns_servers": ["8.8.8.8"]})).await;
        let first = devices::create_group(&state.db, org.id, "first", &ContextVars::new())
            .await
            .expect("group");
        devices::set_group_templates(&state.db, first.id, &[a.id]).await.expect("templates");
        let second = devices::create_group(&state.db, org.id, "second", &ContextVars::new())
            .await
            .expect("group");
        devices::set_group_templates(&state.db, second.id, &[b.id]).await.expect("templates");

        let mut input = DeviceInput::new(org.id, "router-1", "00:11:22:33:44:55", "netjson");
        input.group_id = Some(first.id);
        let (device, config_id) = create_device(&state, input).await.expect("device");
        assert_eq!(configs::template_ids(&state.db, config_id).await.expect("ids"), vec![a.id]);

        change_group(&state, device.id, Some(second.id)).await.expect("group");
        assert_eq!(configs::template_ids(&state.db, config_id).await.expect("ids"), vec![b.id]);
    }
}
