//! Errors

use thiserror::Error;

use crate::transfer::TransferStatus;

/// Payflow Error
#[derive(Debug, Error)]
pub enum Error {
    /// Description exceeds the accepted length
    #[error("Transfer description too long")]
    DescriptionTooLong,
    /// Account identifier is empty
    #[error("Account id cannot be empty")]
    EmptyAccountId,
    /// Idempotency key present but empty
    #[error("Idempotency key cannot be empty")]
    EmptyIdempotencyKey,
    /// Currency code is not a 3-letter uppercase code
    #[error("Invalid currency code: `{0}`")]
    InvalidCurrency(String),
    /// Amount string could not be parsed at scale 2
    #[error("Invalid amount: `{0}`")]
    InvalidAmount(String),
    /// Amount arithmetic overflowed
    #[error("Amount overflow")]
    AmountOverflow,
    /// State machine rejected a transition
    #[error("Invalid transfer state transition from {from} to {to}")]
    InvalidStateTransition {
        /// State the aggregate was in
        from: TransferStatus,
        /// State the caller tried to move to
        to: TransferStatus,
    },
    /// Could not produce an unused reference within the configured retries
    #[error("Could not generate a unique transfer reference")]
    ReferenceExhausted,
    /// No transfer under the given reference
    #[error("Unknown transfer: `{0}`")]
    UnknownTransfer(String),
    /// Database Error
    #[error(transparent)]
    Database(#[from] crate::database::Error),
    /// Account port Error
    #[error(transparent)]
    Account(#[from] crate::account::Error),
    /// Event Error
    #[error(transparent)]
    Event(#[from] crate::event::Error),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// AnyHow Error
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    /// Internal Error
    #[error("Internal Error")]
    Internal,
    /// Custom Error
    #[error("`{0}`")]
    Custom(String),
}
