//! Account Service port.
//!
//! The transfer core never talks to the Account Service directly; it goes
//! through this trait. Concrete transports (REST, gRPC) implement it, as do
//! test backends. Every mutating call carries a `client_ref` that the remote
//! side uses as an idempotency key: repeating an operation on an account
//! with the same `client_ref` returns the same transaction id and applies
//! the mutation at most once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::{Amount, Currency};

/// Account port error
#[derive(Debug, Error)]
pub enum Error {
    /// Account does not exist
    #[error("Account not found: `{0}`")]
    AccountNotFound(AccountId),
    /// Account balance does not cover the requested debit
    #[error("Insufficient funds")]
    InsufficientFunds,
    /// Account exists but does not accept mutations
    #[error("Account is not active: `{0}`")]
    AccountInactive(AccountId),
    /// The Account Service could not be reached or did not answer in time
    #[error("Account service unavailable: {0}")]
    Unavailable(String),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// AnyHow Error
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    /// Custom
    #[error("`{0}`")]
    Custom(String),
}

/// An opaque account identifier owned by the Account Service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the identifier carries no characters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Account lifecycle status as reported by the Account Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    /// Account accepts debits and credits
    Active,
    /// Account is closed to mutations
    Inactive,
    /// Account is temporarily blocked
    Frozen,
}

/// Snapshot of an account returned by [`AccountService::lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Account identifier
    pub id: AccountId,
    /// Current balance
    pub balance: Amount,
    /// Account currency
    pub currency: Currency,
    /// Lifecycle status
    pub status: AccountStatus,
}

/// Account Service port consumed by the transfer orchestrator.
#[async_trait]
pub trait AccountService {
    /// Account port error
    type Err: Into<Error> + From<Error>;

    /// Read an account snapshot
    async fn lookup(&self, account_id: &AccountId) -> Result<AccountInfo, Self::Err>;

    /// Debit `amount` from `account_id`.
    ///
    /// Idempotent on `client_ref`; returns the Account Service transaction id.
    async fn debit(
        &self,
        account_id: &AccountId,
        amount: Amount,
        client_ref: &str,
    ) -> Result<String, Self::Err>;

    /// Credit `amount` to `account_id`.
    ///
    /// Idempotent on `client_ref`; returns the Account Service transaction id.
    async fn credit(
        &self,
        account_id: &AccountId,
        amount: Amount,
        client_ref: &str,
    ) -> Result<String, Self::Err>;
}

/// Type alias for an account port behind a pointer
pub type DynAccountService = Arc<dyn AccountService<Err = Error> + Send + Sync>;
