//! Idempotency cache abstraction.
//!
//! A short-TTL mapping from `idempotency_key` to `reference` sitting in
//! front of the store. Authoritative only when it answers positively: it may
//! lose writes, but it must never report a mapping that was not created by
//! the orchestrator. Misses and errors fall through to the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::transfer::TransferReference;

/// Idempotency cache error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cache backend could not be reached
    #[error("Idempotency cache unavailable: {0}")]
    Unavailable(String),
    /// Custom
    #[error("`{0}`")]
    Custom(String),
}

/// Idempotency cache trait
#[async_trait]
pub trait IdempotencyCache {
    /// Look up the reference mapped to `idempotency_key`, if any
    async fn get(&self, idempotency_key: &str) -> Result<Option<TransferReference>, Error>;

    /// Record a mapping for `ttl`. Best effort; the unique index on the
    /// store is the invariant backstop.
    async fn put(
        &self,
        idempotency_key: &str,
        reference: &TransferReference,
        ttl: Duration,
    ) -> Result<(), Error>;
}

/// Type alias for an idempotency cache behind a pointer
pub type DynIdempotencyCache = Arc<dyn IdempotencyCache + Send + Sync>;
