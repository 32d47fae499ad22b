//! Transfer aggregate and its state machine.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::amount::{Amount, Currency};
use crate::error::Error;
use crate::util::unix_time;

/// Reference prefix for all transfers
pub const REFERENCE_PREFIX: &str = "TXF-";
/// Length of the random reference suffix
pub const REFERENCE_SUFFIX_LEN: usize = 12;
/// Suffix appended to a reference to form the compensation `client_ref`
pub const REVERSAL_SUFFIX: &str = "-REVERSAL";
/// Maximum accepted description length
pub const MAX_DESCRIPTION_LEN: usize = 500;
/// Maximum stored failure reason length
pub const MAX_FAILURE_REASON_LEN: usize = 1000;
/// Separator between accumulated failure reasons
pub const FAILURE_REASON_SEPARATOR: &str = " | ";

const REFERENCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Server-generated unique transfer identifier.
///
/// Also used as the Account Service `client_ref` for the forward pass, which
/// makes the remote debit and credit idempotent per transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferReference(String);

impl TransferReference {
    /// Generate a fresh reference (`TXF-` + 12 uppercase alphanumerics).
    ///
    /// Carries no business semantics; collisions are handled at insert time.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..REFERENCE_SUFFIX_LEN)
            .map(|_| REFERENCE_CHARSET[rng.gen_range(0..REFERENCE_CHARSET.len())] as char)
            .collect();
        Self(format!("{REFERENCE_PREFIX}{suffix}"))
    }

    /// The `client_ref` used for compensating port calls
    pub fn reversal_ref(&self) -> String {
        format!("{}{}", self.0, REVERSAL_SUFFIX)
    }

    /// Reference as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransferReference {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransferReference {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Routing hint carried by a transfer. Does not alter the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferType {
    /// Both accounts live on the same Account Service
    #[default]
    Internal,
    /// Destination account is held by an external institution
    External,
}

/// Transfer lifecycle status.
///
/// ```text
/// PENDING        → VALIDATING | FAILED
/// VALIDATING     → DEBIT_PENDING | FAILED
/// DEBIT_PENDING  → DEBIT_COMPLETED | COMPENSATING
/// DEBIT_COMPLETED→ CREDIT_PENDING
/// CREDIT_PENDING → COMPLETED | COMPENSATING
/// COMPENSATING   → COMPENSATED | FAILED
/// ```
///
/// `PENDING → FAILED` is reserved for recovery tooling expiring transfers
/// that never reached their first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Aggregate persisted, no step attempted yet
    Pending,
    /// Validation step in flight
    Validating,
    /// Debit step about to be invoked
    DebitPending,
    /// Debit succeeded, evidence recorded
    DebitCompleted,
    /// Credit step about to be invoked
    CreditPending,
    /// Terminal success
    Completed,
    /// Rollback in flight
    Compensating,
    /// Terminal, all compensators succeeded
    Compensated,
    /// Terminal failure
    Failed,
}

impl TransferStatus {
    /// True for states the state machine never leaves
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    /// Whether the state machine permits moving to `next`
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Pending, Failed)
                | (Validating, DebitPending)
                | (Validating, Failed)
                | (DebitPending, DebitCompleted)
                | (DebitPending, Compensating)
                | (DebitCompleted, CreditPending)
                | (CreditPending, Completed)
                | (CreditPending, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Validating => "VALIDATING",
            Self::DebitPending => "DEBIT_PENDING",
            Self::DebitCompleted => "DEBIT_COMPLETED",
            Self::CreditPending => "CREDIT_PENDING",
            Self::Completed => "COMPLETED",
            Self::Compensating => "COMPENSATING",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TransferStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "VALIDATING" => Ok(Self::Validating),
            "DEBIT_PENDING" => Ok(Self::DebitPending),
            "DEBIT_COMPLETED" => Ok(Self::DebitCompleted),
            "CREDIT_PENDING" => Ok(Self::CreditPending),
            "COMPLETED" => Ok(Self::Completed),
            "COMPENSATING" => Ok(Self::Compensating),
            "COMPENSATED" => Ok(Self::Compensated),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::Custom(format!("Unknown transfer status: `{s}`"))),
        }
    }
}

/// A request to move funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Account to debit
    pub from_account: AccountId,
    /// Account to credit
    pub to_account: AccountId,
    /// Amount to move
    pub amount: Amount,
    /// Requested currency; must match both accounts
    pub currency: Currency,
    /// Free-text memo
    pub description: Option<String>,
    /// Routing hint
    pub transfer_type: TransferType,
    /// Client-supplied deduplication token
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    /// Create a new transfer request
    pub fn new(
        from_account: impl Into<AccountId>,
        to_account: impl Into<AccountId>,
        amount: Amount,
        currency: Currency,
    ) -> Self {
        Self {
            from_account: from_account.into(),
            to_account: to_account.into(),
            amount,
            currency,
            description: None,
            transfer_type: TransferType::default(),
            idempotency_key: None,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the transfer type
    pub fn with_transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Structural validation, applied before any aggregate exists.
    ///
    /// Business rules (account status, balance, positivity) are the
    /// validation step's job and travel through the state machine instead.
    pub fn validate(&self) -> Result<(), Error> {
        ensure_payflow!(!self.from_account.is_empty(), Error::EmptyAccountId);
        ensure_payflow!(!self.to_account.is_empty(), Error::EmptyAccountId);
        if let Some(description) = &self.description {
            ensure_payflow!(
                description.chars().count() <= MAX_DESCRIPTION_LEN,
                Error::DescriptionTooLong
            );
        }
        if let Some(key) = &self.idempotency_key {
            ensure_payflow!(!key.is_empty(), Error::EmptyIdempotencyKey);
        }
        Ok(())
    }
}

/// The transfer aggregate.
///
/// Mutated only through the explicit methods below; every mutation updates
/// `updated_at`. The store bumps `version` on each persisted mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Globally unique reference, never mutated
    pub reference: TransferReference,
    /// Client-supplied deduplication token, unique when present
    pub idempotency_key: Option<String>,
    /// Account debited
    pub from_account: AccountId,
    /// Account credited
    pub to_account: AccountId,
    /// Amount moved
    pub amount: Amount,
    /// Transfer currency
    pub currency: Currency,
    /// Free-text memo
    pub description: Option<String>,
    /// Routing hint
    pub transfer_type: TransferType,
    /// Current state-machine position
    pub status: TransferStatus,
    /// Account Service transaction id of the successful debit
    pub debit_tx_id: Option<String>,
    /// Account Service transaction id of the successful credit
    pub credit_tx_id: Option<String>,
    /// Accumulated failure reasons, ` | ` separated
    pub failure_reason: Option<String>,
    /// Unix time the transfer was accepted
    pub initiated_at: u64,
    /// Unix time of terminal success, only set when `COMPLETED`
    pub completed_at: Option<u64>,
    /// Unix time the row was created
    pub created_at: u64,
    /// Unix time of the last mutation
    pub updated_at: u64,
    /// Optimistic concurrency token, bumped by the store on every save
    pub version: u64,
}

impl Transfer {
    /// Create a new `PENDING` aggregate from an accepted request
    pub fn new(reference: TransferReference, request: &TransferRequest) -> Self {
        let now = unix_time();
        Self {
            reference,
            idempotency_key: request.idempotency_key.clone(),
            from_account: request.from_account.clone(),
            to_account: request.to_account.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
            transfer_type: request.transfer_type,
            status: TransferStatus::Pending,
            debit_tx_id: None,
            credit_tx_id: None,
            failure_reason: None,
            initiated_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Move to `next`, enforcing the state machine.
    ///
    /// Sets `completed_at` on the transition into `COMPLETED`.
    pub fn transition(&mut self, next: TransferStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = unix_time();
        if next == TransferStatus::Completed {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Record the debit step's transaction id
    pub fn record_debit(&mut self, transaction_id: String) {
        self.debit_tx_id = Some(transaction_id);
        self.updated_at = unix_time();
    }

    /// Record the credit step's transaction id
    pub fn record_credit(&mut self, transaction_id: String) {
        self.credit_tx_id = Some(transaction_id);
        self.updated_at = unix_time();
    }

    /// Append a failure reason, separated from any prior reasons
    pub fn record_failure(&mut self, reason: &str) {
        let accumulated = match self.failure_reason.take() {
            Some(existing) => format!("{existing}{FAILURE_REASON_SEPARATOR}{reason}"),
            None => reason.to_string(),
        };
        self.failure_reason = Some(truncate_reason(accumulated));
        self.updated_at = unix_time();
    }

    /// True once the state machine can no longer move
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_FAILURE_REASON_LEN {
        let mut end = MAX_FAILURE_REASON_LEN;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Caller-visible view of a transfer: every aggregate attribute except the
/// concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Globally unique reference
    pub reference: TransferReference,
    /// Client-supplied deduplication token
    pub idempotency_key: Option<String>,
    /// Account debited
    pub from_account: AccountId,
    /// Account credited
    pub to_account: AccountId,
    /// Amount moved
    pub amount: Amount,
    /// Transfer currency
    pub currency: Currency,
    /// Free-text memo
    pub description: Option<String>,
    /// Routing hint
    pub transfer_type: TransferType,
    /// State-machine position at snapshot time
    pub status: TransferStatus,
    /// Transaction id of the successful debit
    pub debit_tx_id: Option<String>,
    /// Transaction id of the successful credit
    pub credit_tx_id: Option<String>,
    /// Accumulated failure reasons
    pub failure_reason: Option<String>,
    /// Unix time the transfer was accepted
    pub initiated_at: u64,
    /// Unix time of terminal success
    pub completed_at: Option<u64>,
    /// Unix time the row was created
    pub created_at: u64,
    /// Unix time of the last mutation
    pub updated_at: u64,
}

impl From<&Transfer> for TransferSnapshot {
    fn from(transfer: &Transfer) -> Self {
        Self {
            reference: transfer.reference.clone(),
            idempotency_key: transfer.idempotency_key.clone(),
            from_account: transfer.from_account.clone(),
            to_account: transfer.to_account.clone(),
            amount: transfer.amount,
            currency: transfer.currency.clone(),
            description: transfer.description.clone(),
            transfer_type: transfer.transfer_type,
            status: transfer.status,
            debit_tx_id: transfer.debit_tx_id.clone(),
            credit_tx_id: transfer.credit_tx_id.clone(),
            failure_reason: transfer.failure_reason.clone(),
            initiated_at: transfer.initiated_at,
            completed_at: transfer.completed_at,
            created_at: transfer.created_at,
            updated_at: transfer.updated_at,
        }
    }
}
