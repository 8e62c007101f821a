//! Error types
//!
//! Every fallible operation in the crate returns [`AppError`]. Collaborator
//! failures keep their own small types so ports stay independent of the core.

use thiserror::Error;

/// Result alias used across services and jobs.
pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// Opaque failure reported by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct GatewayError(pub String);

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure reported by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown job: {name}")]
    UnknownJob { name: String },

    #[error("escrow cannot be released, current status: {status}")]
    InvalidEscrowState { status: String },

    #[error("payment cannot be refunded, current status: {status}")]
    InvalidPaymentState { status: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("payment failed: {reason}")]
    PaymentFailed { reason: String },

    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job manager not started")]
    SchedulerNotStarted,

    #[error("job manager has been stopped")]
    SchedulerStopped,

    #[error("job manager already started")]
    AlreadyStarted,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Errors the caller caused; never retried and surfaced verbatim.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownJob { .. }
                | Self::InvalidEscrowState { .. }
                | Self::InvalidPaymentState { .. }
        )
    }
}
