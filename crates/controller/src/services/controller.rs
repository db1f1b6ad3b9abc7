//! Device-facing operations behind the controller protocol. Devices
//! authenticate with their key; every failure maps to a short text error.

use std::collections::HashMap;

use common::api::ConfigStatus;
use tracing::{debug, warn};
use uuid::Uuid;

use super::configs as config_service;
use super::devices::{self as device_service, Registration, RegistrationOutcome};
use super::vpn::{self as vpn_service, ServerPackage};
use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::events::ConfigEvent;
use crate::keys;
use crate::metrics::record_status_report;
use crate::persistence::{
    ConfigRecord, DeviceInventoryUpdate, DeviceRecord, VpnRecord, configs, devices,
    organizations, vpns,
};

/// Form or query parameters of one device request.
pub type Params = HashMap<String, String>;

pub fn missing_parameter(name: &str) -> AppError {
    AppError::bad_request(format!("missing required parameter \"{name}\""))
}

pub fn wrong_parameter(name: &str) -> AppError {
    AppError::forbidden(format!("wrong {name}"))
}

/// Non-empty value of `name`, or a missing parameter error.
pub fn required<'a>(params: &'a Params, name: &str) -> ApiResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| missing_parameter(name))
}

fn optional(params: &Params, name: &str) -> Option<String> {
    params.get(name).filter(|value| !value.is_empty()).cloned()
}

/// Device of an active organization that owns a config, authenticated by
/// the `key` parameter.
async fn authenticate(
    state: &AppState,
    raw_device_id: &str,
    params: &Params,
) -> ApiResult<(DeviceRecord, ConfigRecord)> {
    let not_found = || AppError::not_found("device not found");
    let device_id = Uuid::parse_str(raw_device_id).map_err(|_| not_found())?;
    let device = devices::get_device(&state.db, device_id)
        .await?
        .ok_or_else(not_found)?;
    let organization = organizations::get_organization(&state.db, device.organization_id)
        .await?
        .ok_or_else(not_found)?;
    if !organization.is_active {
        return Err(not_found());
    }
    let config = configs::get_config_for_device(&state.db, device.id)
        .await?
        .ok_or_else(not_found)?;

    let key = required(params, "key")?;
    if !keys::secrets_match(&device.key, key) {
        warn!(device_id = %device.id, "device presented a wrong key");
        return Err(wrong_parameter("key"));
    }
    Ok((device, config))
}

fn reject_deactivated(config: &ConfigRecord) -> ApiResult<()> {
    if config.status == ConfigStatus::Deactivated {
        return Err(AppError::not_found("device not found"));
    }
    Ok(())
}

/// `GET /checksum/{id}`.
pub async fn checksum(state: &AppState, raw_device_id: &str, params: &Params) -> ApiResult<String> {
    let (device, config) = authenticate(state, raw_device_id, params).await?;
    reject_deactivated(&config)?;
    let checksum = config_service::checksum(state, config.id).await?;
    state
        .events
        .emit(ConfigEvent::ChecksumRequested { device_id: device.id })
        .await;
    debug!(device_id = %device.id, "checksum served");
    Ok(checksum)
}

/// `GET /download-config/{id}`: file name and package bytes.
pub async fn download(
    state: &AppState,
    raw_device_id: &str,
    params: &Params,
) -> ApiResult<(String, Vec<u8>)> {
    let (device, config) = authenticate(state, raw_device_id, params).await?;
    reject_deactivated(&config)?;
    let package = config_service::download(state, config.id).await?;
    state
        .events
        .emit(ConfigEvent::ConfigDownloadRequested { device_id: device.id })
        .await;
    debug!(device_id = %device.id, bytes = package.1.len(), "configuration downloaded");
    Ok(package)
}

/// VPN server authenticated by its own `key` parameter.
async fn authenticate_vpn(state: &AppState, raw_vpn_id: &str, params: &Params) -> ApiResult<VpnRecord> {
    let not_found = || AppError::not_found("vpn server not found");
    let vpn_id = Uuid::parse_str(raw_vpn_id).map_err(|_| not_found())?;
    let vpn = vpns::get_vpn(&state.db, vpn_id).await?.ok_or_else(not_found)?;
    let key = required(params, "key")?;
    if !keys::secrets_match(&vpn.key, key) {
        warn!(vpn_id = %vpn.id, "vpn server presented a wrong key");
        return Err(wrong_parameter("key"));
    }
    Ok(vpn)
}

/// `GET /vpn/checksum/{id}`.
pub async fn vpn_checksum(state: &AppState, raw_vpn_id: &str, params: &Params) -> ApiResult<String> {
    let vpn = authenticate_vpn(state, raw_vpn_id, params).await?;
    let package = vpn_service::server_package(state, &vpn).await?;
    state
        .events
        .emit(ConfigEvent::VpnChecksumRequested { vpn_id: vpn.id })
        .await;
    debug!(vpn_id = %vpn.id, "vpn checksum served");
    Ok(package.checksum)
}

/// `GET /vpn/download-config/{id}`: file name and package bytes.
pub async fn vpn_download(
    state: &AppState,
    raw_vpn_id: &str,
    params: &Params,
) -> ApiResult<(String, Vec<u8>)> {
    let vpn = authenticate_vpn(state, raw_vpn_id, params).await?;
    let ServerPackage { file_name, archive, .. } = vpn_service::server_package(state, &vpn).await?;
    state
        .events
        .emit(ConfigEvent::VpnConfigDownloadRequested { vpn_id: vpn.id })
        .await;
    debug!(vpn_id = %vpn.id, bytes = archive.len(), "vpn configuration downloaded");
    Ok((file_name, archive))
}

/// `POST /report-status/{id}`; returns the resulting status.
pub async fn report_status(
    state: &AppState,
    raw_device_id: &str,
    params: &Params,
) -> ApiResult<ConfigStatus> {
    let (_, config) = authenticate(state, raw_device_id, params).await?;
    let raw_status = required(params, "status")?;
    let Ok(reported) = ConfigStatus::from_report(raw_status) else {
        record_status_report(raw_status, "invalid");
        return Err(wrong_parameter("status"));
    };
    let error_reason = params.get("error_reason").map(String::as_str);
    match config_service::report_status(state, config.id, reported, error_reason).await {
        Ok(status) => {
            record_status_report(status.as_str(), "accepted");
            Ok(status)
        }
        Err(err) => {
            record_status_report(reported.as_str(), "rejected");
            Err(err)
        }
    }
}

/// `POST /update-info/{id}`: refresh model, os and system.
pub async fn update_info(state: &AppState, raw_device_id: &str, params: &Params) -> ApiResult<()> {
    let (device, _) = authenticate(state, raw_device_id, params).await?;
    device_service::update_inventory(
        state,
        device.id,
        DeviceInventoryUpdate {
            name: None,
            model: optional(params, "model"),
            os: optional(params, "os"),
            system: optional(params, "system"),
        },
    )
    .await?;
    Ok(())
}

/// `POST /register/`.
pub async fn register(state: &AppState, params: &Params) -> ApiResult<RegistrationOutcome> {
    if !state.registration.enabled {
        return Err(AppError::forbidden("registration disabled"));
    }
    let registration = Registration {
        secret: required(params, "secret")?.to_string(),
        name: required(params, "name")?.to_string(),
        mac_address: required(params, "mac_address")?.to_string(),
        backend: required(params, "backend")?.to_string(),
        key: optional(params, "key"),
        hardware_id: optional(params, "hardware_id"),
        tags: params
            .get("tags")
            .map(|tags| tags.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        model: optional(params, "model"),
        os: optional(params, "os"),
        system: optional(params, "system"),
    };
    device_service::register(state, registration).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{self, setup_state};
    use axum::http::StatusCode;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn checksum_requires_the_device_key() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let id = device.id.to_string();

        let err = checksum(&state, &id, &params(&[])).await.expect_err("missing");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "missing required parameter \"key\"");

        let err = checksum(&state, &id, &params(&[("key", "wrong")]))
            .await
            .expect_err("wrong");
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.message, "wrong key");

        let value = checksum(&state, &id, &params(&[("key", &device.key)]))
            .await
            .expect("checksum");
        assert_eq!(value.len(), 64);
    }

    #[tokio::test]
    async fn unknown_or_malformed_ids_are_not_found() {
        let state = setup_state().await;
        let err = checksum(&state, "not-a-uuid", &params(&[("key", "k")]))
            .await
            .expect_err("malformed");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = checksum(&state, &Uuid::new_v4().to_string(), &params(&[("key", "k")]))
            .await
            .expect_err("unknown");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn running_is_reported_as_applied() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let id = device.id.to_string();

        let status = report_status(&state, &id, &params(&[("key", &device.key), ("status", "running")]))
            .await
            .expect("report");
        assert_eq!(status, ConfigStatus::Applied);

        let err = report_status(&state, &id, &params(&[("key", &device.key), ("status", "bogus")]))
            .await
            .expect_err("bogus");
        assert_eq!(err.message, "wrong status");

        let err = report_status(
            &state,
            &id,
            &params(&[("key", &device.key), ("status", "deactivated")]),
        )
        .await
        .expect_err("transition");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deactivated_devices_get_not_found() {
        let state = setup_state().await;
        let org = test_support::organization(&state, "acme").await;
        let device = test_support::device(&state, org.id, "router-1", "00:11:22:33:44:55").await;
        let config_id = test_support::config_id(&state, device.id).await;
        config_service::deactivate(&state, config_id).await.expect("deactivate");

        let err = download(&state, &device.id.to_string(), &params(&[("key", &device.key)]))
            .await
            .expect_err("deactivated");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registration_reports_missing_parameters_in_order() {
        let state = setup_state().await;
        let err = register(&state, &params(&[("secret", "s"), ("name", "r")]))
            .await
            .expect_err("missing");
        assert_eq!(err.message, "missing required parameter \"mac_address\"");
    }
}
