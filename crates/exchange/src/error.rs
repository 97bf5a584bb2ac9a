//! Error taxonomy with stable wire codes.
//!
//! Every precondition failure maps to one code and one HTTP status; the
//! `IntoResponse` impl renders the `{error:{...}}` envelope. The request-id
//! middleware fills `request_id` in on the way out.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::schemas::{ErrorDetail, ErrorResponse};

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AuthRequired(String),

    #[error("{0}")]
    AuthInvalid(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    TaskConflict(String),

    #[error("Idempotency key reused with a different request body")]
    IdempotencyConflict,

    #[error("{0}")]
    InsufficientFunds(String),

    #[error("{0}")]
    InactiveProvider(String),

    #[error("{0}")]
    SpendLimitBreached(String),

    #[error("{0}")]
    AccountFrozen(String),

    #[error("{0}")]
    DependencyUnresolved(String),

    #[error("{message}")]
    RateLimited { message: String, retry_after: u64 },

    #[error("transient storage conflict: {0}")]
    TransientConflict(String),

    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::AuthRequired(_) => "AUTH_REQUIRED",
            Self::AuthInvalid(_) => "AUTH_INVALID",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::TaskConflict(_) => "TASK_CONFLICT",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            Self::InactiveProvider(_) => "INACTIVE_PROVIDER",
            Self::SpendLimitBreached(_) => "SPEND_LIMIT_BREACHED",
            Self::AccountFrozen(_) => "ACCOUNT_FROZEN",
            Self::DependencyUnresolved(_) => "DEPENDENCY_UNRESOLVED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::TransientConflict(_) => "TRANSIENT_CONFLICT",
            Self::Database(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::InsufficientFunds(_)
            | Self::InactiveProvider(_)
            | Self::SpendLimitBreached(_)
            | Self::DependencyUnresolved(_) => StatusCode::BAD_REQUEST,
            Self::AuthRequired(_) | Self::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TaskConflict(_) | Self::IdempotencyConflict => StatusCode::CONFLICT,
            Self::AccountFrozen(_) => StatusCode::LOCKED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::TransientConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = self.status();
        // never leak storage internals onto the wire
        let message = match &self {
            Self::Database(_) | Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        if matches!(self, Self::Database(_) | Self::Internal(_)) {
            tracing::error!("request failed: {self}");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                code: self.code().to_string(),
                message,
                request_id: String::new(),
                details: None,
            },
        });

        let mut response = (status, body).into_response();
        if let Self::RateLimited { retry_after, .. } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// True for unique-index violations (task conflicts, duplicate names).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}

/// True for lock contention worth one retry at the transaction boundary.
pub fn is_transient(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::Database(sqlx::Error::Database(db)) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            // SQLITE_BUSY / SQLITE_LOCKED
            code == "5" || code == "6" || db.message().contains("database is locked")
        }
        ExchangeError::Database(sqlx::Error::PoolTimedOut) => true,
        _ => false,
    }
}
