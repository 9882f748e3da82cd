use crate::db::errors::DbError;
use crate::types::{GroupId, UserId};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The model's policy excludes every group the caller belongs to
    #[error("Access to model {model} from provider {provider} is not permitted for this caller")]
    AccessDenied { provider: String, model: String },

    /// Every candidate credential was excluded
    #[error(
        "No eligible credential among {candidates} candidates ({unusable} unusable, {group_restricted} group-restricted, {rate_limited} rate-limited)"
    )]
    NoEligibleCredential {
        candidates: usize,
        unusable: usize,
        group_restricted: usize,
        rate_limited: usize,
    },

    /// No single funding source in the billing scope can cover the amount
    #[error("Insufficient funds for user {user_id} (group {group_id:?}) to cover {amount}")]
    InsufficientFunds {
        user_id: UserId,
        group_id: Option<GroupId>,
        amount: Decimal,
    },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True when every excluded candidate was excluded by its rate limit, so retrying later may
    /// succeed.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Error::NoEligibleCredential {
                candidates,
                rate_limited,
                ..
            } if *candidates > 0 && rate_limited == candidates
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
            Error::NoEligibleCredential { .. } if self.is_rate_limited() => StatusCode::TOO_MANY_REQUESTS,
            Error::NoEligibleCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::AccessDenied { model, .. } => format!("You do not have access to model {model}"),
            Error::NoEligibleCredential { .. } if self.is_rate_limited() => {
                "All upstream credentials are rate limited. Please retry later.".to_string()
            }
            Error::NoEligibleCredential { .. } => "No upstream credential is available for this request".to_string(),
            Error::InsufficientFunds { .. } => "Insufficient quota or balance".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::AccessDenied { .. } | Error::InsufficientFunds { .. } => {
                tracing::info!("Billing scope error: {}", self);
            }
            Error::NoEligibleCredential { .. } => {
                tracing::warn!("Credential selection error: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
