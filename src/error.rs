//! Error handling module
//!
//! Provides unified error types for the change-ticket engine.

use crate::ticket::TicketStatus;
use thiserror::Error;

/// Failures raised at the inspection boundary.
///
/// These never describe a *verdict* (a rejected statement is an error-level-2
/// row, not an error value); they describe a backend that could not produce
/// one at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InspectionError {
    #[error("Inspection backend unreachable: {0}")]
    Unreachable(String),

    #[error("Inspection backend returned a malformed verdict: {0}")]
    Malformed(String),

    #[error("Operation not supported by inspection backend: {0}")]
    Unsupported(String),
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error(transparent)]
    Inspection(#[from] InspectionError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ticket {ticket_id} cannot {action} while {status}")]
    InvalidTransition {
        ticket_id: u64,
        status: TicketStatus,
        action: &'static str,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Denied: {0}")]
    Denied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Stable machine-readable code, mirrors the codes the API layer reports
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Pool(_) => "POOL_EXHAUSTED",
            AppError::Inspection(_) => "INSPECTION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AppError::PermissionDenied(_) => "PERMISSION_DENIED",
            AppError::Denied(_) => "DENIED",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Result type alias for service operations
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Server-side message of a driver error, falling back to the driver's own text
pub fn db_error_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspection_error_is_transparent() {
        let err: AppError = InspectionError::Unreachable("connection refused".to_string()).into();
        assert_eq!(err.to_string(), "Inspection backend unreachable: connection refused");
        assert_eq!(err.code(), "INSPECTION_ERROR");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = AppError::InvalidTransition {
            ticket_id: 7,
            status: TicketStatus::Finished,
            action: "approve",
        };
        assert_eq!(err.to_string(), "Ticket 7 cannot approve while finished");
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }
}
