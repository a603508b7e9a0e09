//! Application error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::validation::ValidationSummary;

/// Application errors.
///
/// Every variant carries a short message that is safe to show to the
/// caller. Internal detail (database errors, engine I/O) is logged and
/// never returned.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("file too large")]
    FileTooLarge,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("reviewer is not a project member")]
    ReviewerNotMember,

    #[error("only the requester may act on this change request")]
    NotOwnerOfChange,

    #[error("not found")]
    NotFound,

    #[error("change request is not pending review")]
    NotPending,

    #[error("change request was modified concurrently")]
    StaleState,

    #[error("name already in use")]
    NameConflict,

    #[error("cannot remove yourself from the project")]
    CannotRemoveSelf,

    #[error("cannot remove the project owner")]
    CannotRemoveOwner,

    #[error("cannot demote the project owner")]
    CannotDemoteOwner,

    #[error("validation blocked the operation")]
    ValidationBlocked(ValidationSummary),

    #[error("merge conflict")]
    Conflict(Vec<String>),

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("storage engine unreachable")]
    EngineUnreachable,

    #[error("validation timed out")]
    ValidationTimeout,

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::InvalidFile(_) => "invalid_file",
            AppError::UnsupportedFormat(_) => "unsupported_format",
            AppError::FileTooLarge => "file_too_large",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::ReviewerNotMember => "reviewer_not_member",
            AppError::NotOwnerOfChange => "not_owner_of_change",
            AppError::NotFound => "not_found",
            AppError::NotPending => "not_pending",
            AppError::StaleState => "stale_state",
            AppError::NameConflict => "name_conflict",
            AppError::CannotRemoveSelf => "cannot_remove_self",
            AppError::CannotRemoveOwner => "cannot_remove_owner",
            AppError::CannotDemoteOwner => "cannot_demote_owner",
            AppError::ValidationBlocked(_) => "validation_blocked",
            AppError::Conflict(_) => "conflict",
            AppError::MergeFailed(_) => "merge_failed",
            AppError::EngineUnreachable => "engine_unreachable",
            AppError::ValidationTimeout => "validation_timeout",
            AppError::Internal(_) => "internal",
            AppError::Database(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidPayload(_)
            | AppError::InvalidFile(_)
            | AppError::UnsupportedFormat(_)
            | AppError::ReviewerNotMember
            | AppError::ValidationBlocked(_) => StatusCode::BAD_REQUEST,
            AppError::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::NotOwnerOfChange => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::NotPending
            | AppError::StaleState
            | AppError::NameConflict
            | AppError::CannotRemoveSelf
            | AppError::CannotRemoveOwner
            | AppError::CannotDemoteOwner
            | AppError::Conflict(_)
            | AppError::MergeFailed(_) => StatusCode::CONFLICT,
            AppError::EngineUnreachable | AppError::ValidationTimeout => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body returned for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal server error");
                "internal server error".to_string()
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let (validation, conflicts) = match self {
            AppError::ValidationBlocked(summary) => (Some(summary), None),
            AppError::Conflict(list) => (None, Some(list)),
            _ => (None, None),
        };

        let body = ErrorBody {
            error: code,
            message,
            validation,
            conflicts,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;
