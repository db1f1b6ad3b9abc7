use axum::response::IntoResponse;

use crate::error::AppError;

/// Devices parse plain text, so errors are a single `error: ...` line.
pub(crate) fn into_response(err: AppError) -> axum::response::Response {
    let mut response = super::text_response(err.status, format!("error: {}\n", err.message));
    if let Some(headers) = err.headers.as_deref() {
        for (name, value) in headers.iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        into_response(self)
    }
}
