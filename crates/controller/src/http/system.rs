use axum::{Router, routing::get};

use crate::app_state::AppState;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/health", get(healthz))
}

async fn healthz() -> &'static str {
    "ok"
}
