use axum::{
    extract::rejection::JsonRejection,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The application's error type.
///
/// Every variant collapses into one of four caller-visible outcomes
/// (400, 401, 409 or 5xx); the message never says which check failed.
#[derive(Error, Debug)]
pub enum AppError {
    /// Unknown email or wrong password. The two are never distinguished.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The account has a second factor enrolled and no code was supplied.
    #[error("Second factor required")]
    StepUpRequired,

    /// A second factor code was supplied but did not verify.
    #[error("Invalid second factor code")]
    InvalidStepUpCode,

    /// An account with the same email already exists.
    #[error("Duplicate account")]
    DuplicateAccount,

    /// A missing, malformed, revoked or expired access or refresh token.
    #[error("Token invalid or expired")]
    TokenInvalidOrExpired,

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The credential or token store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::StoreUnavailable(format!("postgres: {}", e))
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::StoreUnavailable(format!("pool: {}", e))
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl AppError {
    /// The HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidCredentials
            | AppError::InvalidStepUpCode
            | AppError::TokenInvalidOrExpired => StatusCode::UNAUTHORIZED,
            AppError::StepUpRequired | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::DuplicateAccount => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Encryption(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            AppError::InvalidCredentials => {
                tracing::warn!("Authentication failed: invalid credentials");
                "Invalid email or password".to_string()
            }

            AppError::StepUpRequired => {
                tracing::debug!("Second factor required");
                "2FA required".to_string()
            }

            AppError::InvalidStepUpCode => {
                tracing::debug!("Authentication failed: invalid second factor code");
                "Invalid 2FA code".to_string()
            }

            AppError::DuplicateAccount => {
                tracing::debug!("Duplicate registration attempt");
                "An account with this email already exists".to_string()
            }

            AppError::TokenInvalidOrExpired => {
                tracing::debug!("Rejected invalid or expired token");
                "Invalid or expired token".to_string()
            }

            AppError::Validation(msg) => {
                tracing::debug!("Validation error: {}", msg);
                msg
            }

            AppError::StoreUnavailable(ref e) => {
                tracing::error!("Store unavailable: {}", e);
                "Service temporarily unavailable".to_string()
            }

            AppError::Encryption(ref msg) => {
                tracing::error!("Encryption error: {}", msg);
                "Internal server error".to_string()
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}
