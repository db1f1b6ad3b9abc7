use axum::{
    Router,
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::{app_state::AppState, metrics::HttpMetricsLayer};

mod controller;
mod error_mapper;
mod system;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Device protocol and health endpoints.
pub fn build_router(state: AppState) -> Router<AppState> {
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
        .layer(HttpMetricsLayer);
    Router::<AppState>::new()
        .merge(system::router())
        .merge(controller::router(state))
        .layer(middleware_stack)
}

/// Prometheus scrape endpoint, served on its own listener.
pub fn build_metrics_router() -> Router<AppState> {
    Router::<AppState>::new().route("/metrics", axum::routing::get(metrics))
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<String>) -> Response {
    let mut response = (status, body.into()).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
