use notebook_core::{FieldErrors, ServerKey};
use thiserror::Error;

use crate::identity::IdentityError;
use crate::store::StoreError;

/// Failures surfaced by the lifecycle controller and its HTTP boundary.
///
/// Degraded termination is deliberately absent: a stop that had to give up on
/// confirming the process is gone still succeeds.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Rejected before any side effect.
    #[error("{message}")]
    InvalidRequest {
        message: String,
        field_errors: FieldErrors,
    },

    /// Caller could not be mapped to a system user. No side effect.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("no notebook server running for {0}")]
    NotFound(ServerKey),

    /// Nothing was persisted and any spawned process was cleaned up.
    #[error("failed to launch notebook server: {0}")]
    LaunchFailed(String),

    #[error("server record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl ControlError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            field_errors: FieldErrors::new(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::LaunchFailed(_) => "launch_failed",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<IdentityError> for ControlError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Invalid(_) => Self::invalid(err.to_string()),
            IdentityError::Missing | IdentityError::NotAllowed { .. } => {
                Self::Unauthorized(err.to_string())
            }
        }
    }
}
