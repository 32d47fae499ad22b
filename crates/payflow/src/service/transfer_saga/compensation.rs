//! Compensating actions for the transfer saga.
//!
//! When a forward step fails, the actions registered by completed steps are
//! executed in reverse order (LIFO) to undo their effects on the Account
//! Service. Each action is idempotent: its `client_ref` carries the
//! `-REVERSAL` suffix, so the port applies a reversal at most once without
//! colliding with the forward transaction.

use std::collections::VecDeque;

use async_trait::async_trait;
use payflow_common::account;
use payflow_common::{AccountId, Amount, DynAccountService, Transfer};
use tracing::instrument;

/// A compensating action registered by a completed forward step.
#[async_trait]
pub(crate) trait CompensatingAction: Send + Sync {
    async fn execute(&self, account: &DynAccountService) -> Result<(), account::Error>;
    fn name(&self) -> &'static str;
}

/// Undo a successful debit by crediting the source account back.
pub(crate) struct ReverseDebit {
    /// Account that was debited
    pub account: AccountId,
    /// Amount to return
    pub amount: Amount,
    /// Idempotency reference for the reversal
    pub reversal_ref: String,
}

#[async_trait]
impl CompensatingAction for ReverseDebit {
    #[instrument(skip_all)]
    async fn execute(&self, account: &DynAccountService) -> Result<(), account::Error> {
        tracing::info!(
            "Compensation: crediting {} back to {} ({})",
            self.amount,
            self.account,
            self.reversal_ref
        );
        account
            .credit(&self.account, self.amount, &self.reversal_ref)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReverseDebit"
    }
}

/// Undo a successful credit by debiting the destination account back.
pub(crate) struct ReverseCredit {
    /// Account that was credited
    pub account: AccountId,
    /// Amount to claw back
    pub amount: Amount,
    /// Idempotency reference for the reversal
    pub reversal_ref: String,
}

#[async_trait]
impl CompensatingAction for ReverseCredit {
    #[instrument(skip_all)]
    async fn execute(&self, account: &DynAccountService) -> Result<(), account::Error> {
        tracing::info!(
            "Compensation: debiting {} back from {} ({})",
            self.amount,
            self.account,
            self.reversal_ref
        );
        account
            .debit(&self.account, self.amount, &self.reversal_ref)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReverseCredit"
    }
}

/// Rebuild the compensation list from the step evidence recorded on a
/// persisted aggregate, in LIFO order (credit reversal first).
///
/// Used when resuming a saga after a crash: the transaction ids are the
/// durable record of which steps completed.
pub(crate) fn compensations_for(transfer: &Transfer) -> VecDeque<Box<dyn CompensatingAction>> {
    let mut compensations: VecDeque<Box<dyn CompensatingAction>> = VecDeque::new();
    if transfer.debit_tx_id.is_some() {
        compensations.push_front(Box::new(ReverseDebit {
            account: transfer.from_account.clone(),
            amount: transfer.amount,
            reversal_ref: transfer.reference.reversal_ref(),
        }));
    }
    if transfer.credit_tx_id.is_some() {
        compensations.push_front(Box::new(ReverseCredit {
            account: transfer.to_account.clone(),
            amount: transfer.amount,
            reversal_ref: transfer.reference.reversal_ref(),
        }));
    }
    compensations
}
