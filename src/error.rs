//! Error types for the request lifecycle engine.

use thiserror::Error;

use crate::request::RequestId;

/// Result type alias using the turnstile error type.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Main error type for the request lifecycle engine.
///
/// The first four variants are client errors and are surfaced immediately.
/// `EffectFailed` is a server error that is safe to retry with the identical
/// decision. `DispatchFailed` never reaches the caller of a decision.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Unknown request, notification, actor or domain object
    #[error("Not found: {0}")]
    NotFound(String),

    /// Actor lacks authority for the action, or owns a different record
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request is terminal, or the action is not legal for its kind
    #[error("Invalid transition: request {request_id} is '{state}', cannot {action}")]
    InvalidTransition {
        request_id: RequestId,
        state: String,
        action: String,
    },

    /// Kind-specific guard failed (missing rejection reason, wrong payment method, ...)
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Domain mutation failed; the transition was rolled back
    #[error("Effect failed for request {request_id}: {source}")]
    EffectFailed {
        request_id: RequestId,
        #[source]
        source: Box<TurnstileError>,
    },

    /// Notification creation failed; recovered by background redelivery
    #[error("Notification dispatch failed: {0}")]
    DispatchFailed(String),

    /// Malformed input (payload does not match kind, bad paging, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conditional write lost against a concurrent writer
    #[error("Stale write for request {0}")]
    StaleWrite(RequestId),

    /// The backing store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TurnstileError {
    /// Client errors are reported as-is and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TurnstileError::NotFound(_)
                | TurnstileError::Forbidden(_)
                | TurnstileError::InvalidTransition { .. }
                | TurnstileError::PreconditionFailed(_)
                | TurnstileError::Validation(_)
        )
    }

    /// Whether repeating the identical call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TurnstileError::EffectFailed { .. }
                | TurnstileError::DispatchFailed(_)
                | TurnstileError::Storage(_)
                | TurnstileError::StaleWrite(_)
        )
    }

    pub(crate) fn effect_failed(request_id: RequestId, source: TurnstileError) -> Self {
        TurnstileError::EffectFailed {
            request_id,
            source: Box::new(source),
        }
    }
}
