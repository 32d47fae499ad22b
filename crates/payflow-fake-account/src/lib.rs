//! Fake Account Service backend.
//!
//! Used for testing the transfer orchestrator: accounts are held in memory,
//! failures are scripted per operation and account, every call is recorded,
//! and mutations honor the port's `client_ref` idempotency contract.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use payflow_common::account::{
    self, AccountId, AccountInfo, AccountService, AccountStatus,
};
use payflow_common::{Amount, Currency};
use tokio::sync::Mutex;
use tokio::time;
use uuid::Uuid;

/// Scripted failure behavior for one operation on one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Report the account as missing
    NotFound,
    /// Report the account as inactive
    Inactive,
    /// Reject the mutation for lack of funds
    InsufficientFunds,
    /// Simulate an unreachable backend
    Unavailable,
}

impl FailureMode {
    fn into_error(self, account_id: &AccountId) -> account::Error {
        match self {
            Self::NotFound => account::Error::AccountNotFound(account_id.clone()),
            Self::Inactive => account::Error::AccountInactive(account_id.clone()),
            Self::InsufficientFunds => account::Error::InsufficientFunds,
            Self::Unavailable => {
                account::Error::Unavailable("fake account service offline".to_string())
            }
        }
    }
}

/// Port operations, used to key scripted failures and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Account lookup
    Lookup,
    /// Balance-decreasing mutation
    Debit,
    /// Balance-increasing mutation
    Credit,
}

/// One recorded port call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCall {
    /// Operation invoked
    pub kind: CallKind,
    /// Target account
    pub account: AccountId,
    /// Amount for mutations, `None` for lookups
    pub amount: Option<Amount>,
    /// Idempotency reference for mutations
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeAccount {
    balance: Amount,
    currency: Currency,
    status: AccountStatus,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<AccountId, FakeAccount>,
    // One mutation per (operation, account, client_ref); repeats get the
    // transaction id already handed out
    transactions: HashMap<(CallKind, AccountId, String), String>,
    failures: HashMap<(CallKind, AccountId), FailureMode>,
    calls: Vec<AccountCall>,
}

/// Fake Account Service
#[derive(Debug, Clone, Default)]
pub struct FakeAccountService {
    inner: Arc<Mutex<Inner>>,
    response_delay: Option<Duration>,
}

impl FakeAccountService {
    /// Create an empty fake backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every port response, for deadline tests
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    /// Register an account
    pub async fn add_account(
        &self,
        account_id: impl Into<AccountId>,
        balance: Amount,
        currency: Currency,
        status: AccountStatus,
    ) {
        self.inner.lock().await.accounts.insert(
            account_id.into(),
            FakeAccount {
                balance,
                currency,
                status,
            },
        );
    }

    /// Script a failure for one operation on one account
    pub async fn set_failure(
        &self,
        kind: CallKind,
        account_id: impl Into<AccountId>,
        mode: FailureMode,
    ) {
        self.inner
            .lock()
            .await
            .failures
            .insert((kind, account_id.into()), mode);
    }

    /// Current balance of an account, if registered
    pub async fn balance(&self, account_id: &AccountId) -> Option<Amount> {
        self.inner
            .lock()
            .await
            .accounts
            .get(account_id)
            .map(|a| a.balance)
    }

    /// Every call made against the backend, in order
    pub async fn calls(&self) -> Vec<AccountCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Mutating calls (debits and credits) made against the backend, in order
    pub async fn mutation_calls(&self) -> Vec<AccountCall> {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.kind != CallKind::Lookup)
            .cloned()
            .collect()
    }

    async fn delay(&self) {
        if let Some(delay) = self.response_delay {
            time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AccountService for FakeAccountService {
    type Err = account::Error;

    async fn lookup(&self, account_id: &AccountId) -> Result<AccountInfo, Self::Err> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.calls.push(AccountCall {
            kind: CallKind::Lookup,
            account: account_id.clone(),
            amount: None,
            client_ref: None,
        });

        if let Some(mode) = inner.failures.get(&(CallKind::Lookup, account_id.clone())) {
            return Err(mode.into_error(account_id));
        }

        let account = inner
            .accounts
            .get(account_id)
            .ok_or_else(|| account::Error::AccountNotFound(account_id.clone()))?;

        Ok(AccountInfo {
            id: account_id.clone(),
            balance: account.balance,
            currency: account.currency.clone(),
            status: account.status,
        })
    }

    async fn debit(
        &self,
        account_id: &AccountId,
        amount: Amount,
        client_ref: &str,
    ) -> Result<String, Self::Err> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.calls.push(AccountCall {
            kind: CallKind::Debit,
            account: account_id.clone(),
            amount: Some(amount),
            client_ref: Some(client_ref.to_string()),
        });

        // Idempotency: a repeated client_ref returns the original
        // transaction without touching the balance again
        let key = (CallKind::Debit, account_id.clone(), client_ref.to_string());
        if let Some(transaction_id) = inner.transactions.get(&key) {
            return Ok(transaction_id.clone());
        }

        if let Some(mode) = inner.failures.get(&(CallKind::Debit, account_id.clone())) {
            return Err(mode.into_error(account_id));
        }

        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| account::Error::AccountNotFound(account_id.clone()))?;
        if account.status != AccountStatus::Active {
            return Err(account::Error::AccountInactive(account_id.clone()));
        }
        if account.balance < amount {
            return Err(account::Error::InsufficientFunds);
        }

        account.balance = account
            .balance
            .checked_sub(amount)
            .ok_or(account::Error::InsufficientFunds)?;

        let transaction_id = Uuid::new_v4().to_string();
        inner.transactions.insert(key, transaction_id.clone());
        tracing::debug!("Fake debit of {} from {}", amount, account_id);
        Ok(transaction_id)
    }

    async fn credit(
        &self,
        account_id: &AccountId,
        amount: Amount,
        client_ref: &str,
    ) -> Result<String, Self::Err> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.calls.push(AccountCall {
            kind: CallKind::Credit,
            account: account_id.clone(),
            amount: Some(amount),
            client_ref: Some(client_ref.to_string()),
        });

        let key = (CallKind::Credit, account_id.clone(), client_ref.to_string());
        if let Some(transaction_id) = inner.transactions.get(&key) {
            return Ok(transaction_id.clone());
        }

        if let Some(mode) = inner.failures.get(&(CallKind::Credit, account_id.clone())) {
            return Err(mode.into_error(account_id));
        }

        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| account::Error::AccountNotFound(account_id.clone()))?;
        if account.status != AccountStatus::Active {
            return Err(account::Error::AccountInactive(account_id.clone()));
        }

        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| account::Error::Custom("balance overflow".to_string()))?;

        let transaction_id = Uuid::new_v4().to_string();
        inner.transactions.insert(key, transaction_id.clone());
        tracing::debug!("Fake credit of {} to {}", amount, account_id);
        Ok(transaction_id)
    }
}
