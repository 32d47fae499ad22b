//! Transfer lifecycle events.
//!
//! One event per terminal-relevant state transition, keyed by the transfer
//! reference so a partitioned bus delivers every event for one transfer in
//! order. Delivery is at-least-once; consumers deduplicate by
//! `(reference, status)`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::transfer::{Transfer, TransferReference, TransferSnapshot};

/// Event publishing error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bus rejected or could not accept the event
    #[error("Event publish failed: {0}")]
    Publish(String),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// The four lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEventKind {
    /// Aggregate persisted `PENDING` and accepted for execution
    Initiated,
    /// Terminal success
    Completed,
    /// Terminal failure, validation or compensation
    Failed,
    /// Terminal rollback
    Compensated,
}

impl TransferEventKind {
    /// Topic the event is published on
    pub fn topic(self) -> &'static str {
        match self {
            Self::Initiated => "transfer.initiated",
            Self::Completed => "transfer.completed",
            Self::Failed => "transfer.failed",
            Self::Compensated => "transfer.compensated",
        }
    }
}

/// A lifecycle event: kind plus a snapshot of the aggregate at emission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Event kind
    pub kind: TransferEventKind,
    /// Aggregate snapshot at emission time
    pub transfer: TransferSnapshot,
}

impl TransferEvent {
    /// Build an event from the persisted aggregate
    pub fn new(kind: TransferEventKind, transfer: &Transfer) -> Self {
        Self {
            kind,
            transfer: TransferSnapshot::from(transfer),
        }
    }

    /// Topic the event belongs on
    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }

    /// Partition key: all events for one transfer share it
    pub fn partition_key(&self) -> &TransferReference {
        &self.transfer.reference
    }
}

/// Event publisher trait.
///
/// Publication happens only after the corresponding state has been durably
/// persisted; a failure here is logged by the orchestrator and never rolls
/// back committed state.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event
    async fn publish(&self, event: TransferEvent) -> Result<(), Error>;
}

/// Type alias for an event publisher behind a pointer
pub type DynEventPublisher = Arc<dyn EventPublisher>;
