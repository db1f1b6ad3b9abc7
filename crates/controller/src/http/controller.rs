//! Plain-text endpoints polled by devices.

use axum::{
    Extension, Form, Router,
    extract::{Path, Query, Request, State},
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use common::api::CONTROLLER_HEADER;
use tower_http::{limit::RequestBodyLimitLayer, request_id::RequestId};
use tracing::debug;

use super::text_response;
use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    services::controller::{self as controller_service, Params},
    telemetry,
};

pub fn router(state: AppState) -> Router<AppState> {
    let register_limit = state.limits.register_body_bytes as usize;
    Router::<AppState>::new()
        .route("/checksum/{device_id}", get(checksum))
        .route("/download-config/{device_id}", get(download_config))
        .route("/vpn/checksum/{vpn_id}", get(vpn_checksum))
        .route("/vpn/download-config/{vpn_id}", get(vpn_download_config))
        .route("/report-status/{device_id}", post(report_status))
        .route("/update-info/{device_id}", post(update_info))
        .route(
            "/register/",
            post(register).layer(RequestBodyLimitLayer::new(register_limit)),
        )
        .layer(middleware::from_fn(mark_controller_response))
}

/// Devices check this header to tell the controller apart from a proxy.
async fn mark_controller_response(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(CONTROLLER_HEADER, HeaderValue::from_static("true"));
    response
}

/// Query string values with form fields layered on top.
fn merge_params(query: Params, form: Params) -> Params {
    let mut params = query;
    params.extend(form);
    params
}

async fn checksum(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<Params>,
) -> ApiResult<Response> {
    let checksum = controller_service::checksum(&state, &device_id, &params).await?;
    Ok(text_response(StatusCode::OK, checksum))
}

async fn download_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<Params>,
) -> ApiResult<Response> {
    let (file_name, package) = controller_service::download(&state, &device_id, &params).await?;
    package_response(&file_name, package)
}

fn package_response(file_name: &str, package: Vec<u8>) -> ApiResult<Response> {
    let disposition = HeaderValue::from_str(&format!("attachment; filename={file_name}"))
        .map_err(|_| AppError::internal("invalid package file name"))?;
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (CONTENT_DISPOSITION, disposition),
        ],
        package,
    )
        .into_response())
}

async fn vpn_checksum(
    State(state): State<AppState>,
    Path(vpn_id): Path<String>,
    Query(params): Query<Params>,
) -> ApiResult<Response> {
    let checksum = controller_service::vpn_checksum(&state, &vpn_id, &params).await?;
    Ok(text_response(StatusCode::OK, checksum))
}

async fn vpn_download_config(
    State(state): State<AppState>,
    Path(vpn_id): Path<String>,
    Query(params): Query<Params>,
) -> ApiResult<Response> {
    let (file_name, package) = controller_service::vpn_download(&state, &vpn_id, &params).await?;
    package_response(&file_name, package)
}

async fn report_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<Params>,
    Form(form): Form<Params>,
) -> ApiResult<Response> {
    let params = merge_params(query, form);
    let status = controller_service::report_status(&state, &device_id, &params).await?;
    Ok(text_response(
        StatusCode::OK,
        format!("report-result: success\ncurrent-status: {}\n", status.as_str()),
    ))
}

async fn update_info(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<Params>,
    Form(form): Form<Params>,
) -> ApiResult<Response> {
    let params = merge_params(query, form);
    controller_service::update_info(&state, &device_id, &params).await?;
    Ok(text_response(StatusCode::OK, "update-info: success\n"))
}

async fn register(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    Form(params): Form<Params>,
) -> ApiResult<Response> {
    let outcome = controller_service::register(&state, &params).await?;
    let device = &outcome.device;
    debug!(
        device_id = %device.id,
        request_id = telemetry::request_id_from_extension(request_id.as_ref().map(|ext| &ext.0)),
        "registration answered"
    );
    let body = format!(
        "registration-result: success\nuuid: {}\nkey: {}\nhostname: {}\nis-new: {}\n",
        device.id.simple(),
        device.key,
        device.name,
        u8::from(outcome.is_new),
    );
    Ok(text_response(StatusCode::CREATED, body))
}
