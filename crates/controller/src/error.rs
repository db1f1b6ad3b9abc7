use axum::http::{HeaderMap, StatusCode};
use sqlx::{Error as SqlxError, error::DatabaseError};
use tracing::error;

/// Application error type for services and HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub headers: Option<Box<HeaderMap>>,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

const DB_UNAVAILABLE_MESSAGE: &str = "database temporarily unavailable";

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: msg.into(),
            headers: None,
        }
    }

    /// Field-scoped validation failure (template invariants, schema errors).
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            message: msg.into(),
            headers: None,
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: msg.into(),
            headers: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: msg.into(),
            headers: None,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "conflict",
            message: msg.into(),
            headers: None,
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "service_unavailable",
            message: msg.into(),
            headers: None,
        }
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "payload_too_large",
            message: msg.into(),
            headers: None,
        }
    }

    pub fn internal(msg: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: msg.to_string(),
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(Box::new(headers));
        self
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status.as_u16(), self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Busy,
}

fn map_anyhow_error(err: &anyhow::Error) -> Option<AppError> {
    let sqlx_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())?;
    map_sqlx_error(sqlx_err)
}

fn map_sqlx_error(err: &SqlxError) -> Option<AppError> {
    match err {
        SqlxError::RowNotFound => Some(AppError::not_found("resource not found")),
        SqlxError::Database(db_err) => map_database_error(db_err.as_ref()),
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE))
        }
        _ => None,
    }
}

fn map_database_error(err: &dyn DatabaseError) -> Option<AppError> {
    let kind = classify_db_error(err.code().as_deref(), err.message())?;
    match kind {
        DbErrorKind::UniqueViolation => Some(AppError::conflict("resource already exists")),
        DbErrorKind::ForeignKeyViolation => Some(AppError::bad_request("invalid reference")),
        DbErrorKind::NotNullViolation => Some(AppError::bad_request("missing required field")),
        DbErrorKind::CheckViolation => Some(AppError::bad_request("invalid request")),
        DbErrorKind::Busy => Some(AppError::service_unavailable(DB_UNAVAILABLE_MESSAGE)),
    }
}

fn classify_db_error(code: Option<&str>, message: &str) -> Option<DbErrorKind> {
    let code = code.unwrap_or_default();
    let message = message.to_ascii_lowercase();

    if matches!(code, "2067" | "1555") || message.contains("unique constraint") {
        return Some(DbErrorKind::UniqueViolation);
    }

    if code == "787" || message.contains("foreign key constraint") {
        return Some(DbErrorKind::ForeignKeyViolation);
    }

    if code == "1299" || message.contains("not null constraint") {
        return Some(DbErrorKind::NotNullViolation);
    }

    if code == "275" || message.contains("check constraint") {
        return Some(DbErrorKind::CheckViolation);
    }

    if message.contains("database is locked") || message.contains("database is busy") {
        return Some(DbErrorKind::Busy);
    }

    None
}

/// Duplicate inserts racing each other are benign; callers use this to
/// treat them as "already exists".
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    let Some(sqlx_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    else {
        return false;
    };

    match sqlx_err {
        SqlxError::Database(db_err) => matches!(
            classify_db_error(db_err.code().as_deref(), db_err.message()),
            Some(DbErrorKind::UniqueViolation)
        ),
        _ => false,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(app_err) = err.downcast_ref::<AppError>() {
            return AppError {
                status: app_err.status,
                code: app_err.code,
                message: app_err.message.clone(),
                headers: app_err.headers.clone(),
            };
        }
        if let Some(mapped) = map_anyhow_error(&err) {
            if mapped.status.is_server_error() {
                crate::telemetry::record_internal_error_metrics(&err);
                error!(?err, "internal error");
            }
            return mapped;
        }

        crate::telemetry::record_internal_error_metrics(&err);
        error!(?err, "internal error");
        AppError::internal("internal server error")
    }
}

impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<crate::backend::CompileError> for AppError {
    fn from(err: crate::backend::CompileError) -> Self {
        match err {
            crate::backend::CompileError::UnknownBackend(_)
            | crate::backend::CompileError::Validation(_) => {
                AppError::validation(err.to_string())
            }
            other => AppError::from(anyhow::Error::new(other)),
        }
    }
}

impl From<crate::services::templates::TemplateError> for AppError {
    fn from(err: crate::services::templates::TemplateError) -> Self {
        AppError::validation(err.to_string())
    }
}

impl From<crate::addressing::AddressingError> for AppError {
    fn from(err: crate::addressing::AddressingError) -> Self {
        AppError::validation(err.to_string())
    }
}

impl From<crate::status::TransitionError> for AppError {
    fn from(err: crate::status::TransitionError) -> Self {
        AppError::bad_request(err.to_string())
    }
}
