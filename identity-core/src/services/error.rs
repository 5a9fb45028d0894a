use service_core::error::AppError;
use thiserror::Error;

use super::refresh_ledger::LedgerError;
use super::store::StoreError;

/// Errors surfaced by the public operations of the core.
///
/// Every variant except `Internal` is safe to show a caller as-is.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired verification code")]
    InvalidTwoFactorCode,

    #[error("Verification code could not be delivered")]
    ChallengeDeliveryFailed,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Too many attempts, retry after {retry_after} seconds")]
    TooManyAttempts { retry_after: u64 },

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound("Record not found".to_string()),
            StoreError::Unavailable(e) => ServiceError::Internal(e),
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidRefreshToken => ServiceError::InvalidRefreshToken,
            LedgerError::TokenReuseDetected { .. } => ServiceError::TokenReuseDetected,
            LedgerError::Store(e) => e.into(),
            LedgerError::Internal(e) => ServiceError::Internal(e),
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::InvalidTwoFactorCode => {
                AppError::AuthError(anyhow::anyhow!("Invalid or expired verification code"))
            }
            ServiceError::ChallengeDeliveryFailed => {
                AppError::BadGateway("Verification code could not be delivered".to_string())
            }
            ServiceError::InvalidRefreshToken => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid refresh token"))
            }
            ServiceError::TokenReuseDetected => {
                AppError::Unauthorized(anyhow::anyhow!("Session revoked"))
            }
            ServiceError::PermissionDenied => {
                AppError::Forbidden(anyhow::anyhow!("Permission denied"))
            }
            ServiceError::ValidationError(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            ServiceError::TooManyAttempts { retry_after } => {
                AppError::TooManyRequests("Too many attempts".to_string(), Some(retry_after))
            }
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
