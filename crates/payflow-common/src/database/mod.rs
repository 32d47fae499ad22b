//! Transfer store abstraction.
//!
//! A durable mapping keyed by `reference` with a secondary unique index on
//! `idempotency_key`. Every save is its own transaction; cross-step atomicity
//! comes from the saga and its compensators, never from wrapping port calls
//! in a database transaction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::account::AccountId;
use crate::transfer::{Transfer, TransferReference};

/// Transfer store error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unique index violation on `reference`
    #[error("Duplicate transfer reference")]
    Duplicate,
    /// Unique index violation on `idempotency_key`
    #[error("Duplicate idempotency key")]
    DuplicateIdempotencyKey,
    /// Optimistic concurrency loss: the stored version differs from the
    /// version the writer observed
    #[error("Concurrent modification of transfer")]
    ConcurrentModification,
    /// No transfer under the given reference
    #[error("Unknown transfer")]
    UnknownTransfer,
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Database Error
    #[error(transparent)]
    Database(Box<dyn std::error::Error + Send + Sync>),
}

/// Transfer store trait
#[async_trait]
pub trait TransferDatabase {
    /// Insert a new transfer.
    ///
    /// Fails with [`Error::Duplicate`] when the reference is taken and
    /// [`Error::DuplicateIdempotencyKey`] when the idempotency key is.
    async fn add_transfer(&self, transfer: Transfer) -> Result<(), Error>;

    /// Persist a mutation under optimistic concurrency.
    ///
    /// Succeeds only when the stored version equals `transfer.version`; the
    /// persisted row carries `version + 1` and is returned so the caller can
    /// continue from it. Fails with [`Error::ConcurrentModification`] on a
    /// version mismatch.
    async fn update_transfer(&self, transfer: &Transfer) -> Result<Transfer, Error>;

    /// Get a transfer by its reference
    async fn get_transfer_by_reference(
        &self,
        reference: &TransferReference,
    ) -> Result<Option<Transfer>, Error>;

    /// Get a transfer by its idempotency key
    async fn get_transfer_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Transfer>, Error>;

    /// All transfers debiting or crediting the account
    async fn get_transfers_by_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<Transfer>, Error>;

    /// All transfers debiting the account
    async fn get_transfers_from(&self, account_id: &AccountId) -> Result<Vec<Transfer>, Error>;

    /// All transfers crediting the account
    async fn get_transfers_to(&self, account_id: &AccountId) -> Result<Vec<Transfer>, Error>;

    /// Non-terminal transfers whose last mutation is at least `older_than`
    /// in the past, for recovery tooling
    async fn get_stuck_transfers(&self, older_than: Duration) -> Result<Vec<Transfer>, Error>;
}

/// Type alias for a transfer store behind a pointer
pub type DynTransferDatabase = Arc<dyn TransferDatabase + Send + Sync>;
