use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use payflow_common::account::{self, AccountInfo, AccountStatus};
use payflow_common::event::TransferEventKind;
use payflow_common::{
    AccountId, DynAccountService, DynEventPublisher, DynTransferDatabase, Error, Transfer,
    TransferEvent, TransferStatus,
};
use tokio::time;
use tracing::instrument;

use self::compensation::{compensations_for, CompensatingAction, ReverseCredit, ReverseDebit};
use self::state::{Credited, Debited, Ready, StepOutcome, Validated};

pub(crate) mod compensation;
pub(crate) mod state;

#[cfg(test)]
mod tests;

/// Saga pattern implementation for atomic transfers.
///
/// # Why a saga?
///
/// A transfer spans two mutations on a remote Account Service (debit the
/// source, credit the destination) plus local persistence. No database
/// transaction can cover the remote calls, so atomicity comes from the saga
/// discipline instead:
///
/// - every state transition is persisted before the next step is invoked,
///   leaving a recoverable checkpoint if the process crashes mid-flight;
/// - each completed step registers a compensating action;
/// - when a step fails after validation, the registered actions run in
///   reverse order and return both accounts to their starting balances.
///
/// # Forward flow
///
/// ```text
/// TransferSaga<Ready>
///   └─> validate() -> TransferSaga<Validated>   (no side effects)
///         └─> debit() -> TransferSaga<Debited>  (registers ReverseDebit)
///               └─> credit() -> TransferSaga<Credited> (registers ReverseCredit)
///                     └─> finalize() -> Transfer (COMPLETED)
/// ```
///
/// The typestate parameter makes illegal orderings unrepresentable: calling
/// `credit()` before `debit()` does not compile, and no runtime state checks
/// are needed.
///
/// # Failure handling
///
/// A validation failure has nothing to undo and drives the aggregate
/// straight to `FAILED`. A debit or credit failure (business rejection,
/// unavailability, or an exceeded deadline) moves the aggregate to
/// `COMPENSATING`, walks the registered actions in LIFO order, and lands on
/// `COMPENSATED`, or on `FAILED` with the compensator errors appended to the
/// failure reason when a reversal itself cannot be applied. Store failures
/// while persisting a checkpoint surface as `Err` and leave the last durable
/// checkpoint for recovery.
pub(crate) struct TransferSaga<S> {
    store: DynTransferDatabase,
    account: DynAccountService,
    publisher: DynEventPublisher,
    port_deadline: Duration,
    /// Compensating actions in LIFO order (most recent first)
    compensations: VecDeque<Box<dyn CompensatingAction>>,
    /// State-specific data
    state_data: S,
}

impl TransferSaga<Ready> {
    /// Start a saga for a freshly persisted `PENDING` aggregate.
    pub(crate) fn new(
        store: DynTransferDatabase,
        account: DynAccountService,
        publisher: DynEventPublisher,
        port_deadline: Duration,
        transfer: Transfer,
    ) -> Self {
        Self {
            store,
            account,
            publisher,
            port_deadline,
            compensations: VecDeque::new(),
            state_data: Ready { transfer },
        }
    }

    /// Rebuild a saga around a recovered aggregate, deriving the
    /// compensation list from recorded step evidence.
    pub(crate) fn resume(
        store: DynTransferDatabase,
        account: DynAccountService,
        publisher: DynEventPublisher,
        port_deadline: Duration,
        transfer: Transfer,
    ) -> Self {
        let compensations = compensations_for(&transfer);
        Self {
            store,
            account,
            publisher,
            port_deadline,
            compensations,
            state_data: Ready { transfer },
        }
    }

    /// Run the compensation path for a recovered aggregate.
    pub(crate) async fn run_compensation(self, reason: &str) -> Result<Transfer, Error> {
        let transfer = self.state_data.transfer.clone();
        self.compensate_all(transfer, reason).await
    }

    /// Validation step: read both accounts and enforce the business
    /// preconditions, in order, first failure short-circuiting.
    ///
    /// The step has no side effects, so a failure needs no compensation and
    /// drives the aggregate straight to `FAILED`.
    #[instrument(skip_all, fields(reference = %self.state_data.transfer.reference))]
    pub(crate) async fn validate(self) -> Result<StepOutcome<TransferSaga<Validated>>, Error> {
        let mut transfer = self.state_data.transfer.clone();
        transfer.transition(TransferStatus::Validating)?;
        let transfer = self.persist(&transfer).await?;

        if let Some(reason) = self.validation_failure(&transfer).await {
            tracing::info!("Transfer {} failed validation: {}", transfer.reference, reason);
            let transfer = self.fail_without_compensation(transfer, &reason).await?;
            return Ok(StepOutcome::Terminal(transfer));
        }

        tracing::debug!("Validation passed for {}", transfer.reference);
        Ok(StepOutcome::Advanced(TransferSaga {
            store: self.store,
            account: self.account,
            publisher: self.publisher,
            port_deadline: self.port_deadline,
            compensations: self.compensations,
            state_data: Validated { transfer },
        }))
    }

    /// First business-precondition violation, if any.
    async fn validation_failure(&self, transfer: &Transfer) -> Option<String> {
        if transfer.from_account == transfer.to_account {
            return Some("debit and credit accounts must differ".to_string());
        }

        let from = match self.lookup(&transfer.from_account, "debit").await {
            Ok(info) => info,
            Err(reason) => return Some(reason),
        };
        if from.status != AccountStatus::Active {
            return Some(format!(
                "debit account {} is not active",
                transfer.from_account
            ));
        }

        let to = match self.lookup(&transfer.to_account, "credit").await {
            Ok(info) => info,
            Err(reason) => return Some(reason),
        };
        if to.status != AccountStatus::Active {
            return Some(format!(
                "credit account {} is not active",
                transfer.to_account
            ));
        }

        if from.currency != transfer.currency {
            return Some(format!(
                "debit account currency {} does not match transfer currency {}",
                from.currency, transfer.currency
            ));
        }
        if to.currency != transfer.currency {
            return Some(format!(
                "credit account currency {} does not match transfer currency {}",
                to.currency, transfer.currency
            ));
        }

        if from.balance < transfer.amount {
            return Some(format!(
                "insufficient balance: {} available, {} requested",
                from.balance, transfer.amount
            ));
        }

        if transfer.amount.is_zero() || transfer.amount.is_negative() {
            return Some("transfer amount must be positive".to_string());
        }

        None
    }

    async fn lookup(&self, account_id: &AccountId, role: &str) -> Result<AccountInfo, String> {
        self.with_deadline(self.account.lookup(account_id))
            .await
            .map_err(|err| match err {
                account::Error::AccountNotFound(_) => {
                    format!("{role} account {account_id} not found")
                }
                err => format!("{role} account {account_id} lookup failed: {err}"),
            })
    }
}

impl TransferSaga<Validated> {
    /// Debit step: take the amount from the source account.
    ///
    /// The forward `client_ref` is the transfer reference, so a retried call
    /// cannot double-debit. On success the returned transaction id is
    /// persisted with the `DEBIT_COMPLETED` checkpoint before the saga may
    /// continue; that durable evidence is what compensation relies on.
    #[instrument(skip_all, fields(reference = %self.state_data.transfer.reference))]
    pub(crate) async fn debit(mut self) -> Result<StepOutcome<TransferSaga<Debited>>, Error> {
        let mut transfer = self.state_data.transfer.clone();
        transfer.transition(TransferStatus::DebitPending)?;
        let mut transfer = self.persist(&transfer).await?;

        let debit_result = self
            .with_deadline(self.account.debit(
                &transfer.from_account,
                transfer.amount,
                transfer.reference.as_str(),
            ))
            .await;

        match debit_result {
            Ok(transaction_id) => {
                transfer.record_debit(transaction_id);
                transfer.transition(TransferStatus::DebitCompleted)?;
                let transfer = self.persist(&transfer).await?;

                self.compensations.push_front(Box::new(ReverseDebit {
                    account: transfer.from_account.clone(),
                    amount: transfer.amount,
                    reversal_ref: transfer.reference.reversal_ref(),
                }));

                Ok(StepOutcome::Advanced(TransferSaga {
                    store: self.store,
                    account: self.account,
                    publisher: self.publisher,
                    port_deadline: self.port_deadline,
                    compensations: self.compensations,
                    state_data: Debited { transfer },
                }))
            }
            Err(err) => {
                tracing::info!("Debit failed for {}: {}", transfer.reference, err);
                let transfer = self
                    .compensate_all(transfer, &format!("debit failed: {err}"))
                    .await?;
                Ok(StepOutcome::Terminal(transfer))
            }
        }
    }
}

impl TransferSaga<Debited> {
    /// Rebuild a saga at the debited checkpoint from a recovered aggregate.
    ///
    /// The `DEBIT_COMPLETED` checkpoint proves the debit landed and the
    /// credit was never attempted, so the saga may resume forward.
    pub(crate) fn resume_debited(
        store: DynTransferDatabase,
        account: DynAccountService,
        publisher: DynEventPublisher,
        port_deadline: Duration,
        transfer: Transfer,
    ) -> Self {
        let compensations = compensations_for(&transfer);
        Self {
            store,
            account,
            publisher,
            port_deadline,
            compensations,
            state_data: Debited { transfer },
        }
    }

    /// Credit step: hand the amount to the destination account.
    ///
    /// On success the transaction id is persisted immediately, before the
    /// terminal checkpoint, so the evidence survives a crash between the
    /// two saves.
    #[instrument(skip_all, fields(reference = %self.state_data.transfer.reference))]
    pub(crate) async fn credit(mut self) -> Result<StepOutcome<TransferSaga<Credited>>, Error> {
        let mut transfer = self.state_data.transfer.clone();
        transfer.transition(TransferStatus::CreditPending)?;
        let mut transfer = self.persist(&transfer).await?;

        let credit_result = self
            .with_deadline(self.account.credit(
                &transfer.to_account,
                transfer.amount,
                transfer.reference.as_str(),
            ))
            .await;

        match credit_result {
            Ok(transaction_id) => {
                transfer.record_credit(transaction_id);
                let transfer = self.persist(&transfer).await?;

                self.compensations.push_front(Box::new(ReverseCredit {
                    account: transfer.to_account.clone(),
                    amount: transfer.amount,
                    reversal_ref: transfer.reference.reversal_ref(),
                }));

                Ok(StepOutcome::Advanced(TransferSaga {
                    store: self.store,
                    account: self.account,
                    publisher: self.publisher,
                    port_deadline: self.port_deadline,
                    compensations: self.compensations,
                    state_data: Credited { transfer },
                }))
            }
            Err(err) => {
                tracing::info!("Credit failed for {}: {}", transfer.reference, err);
                let transfer = self
                    .compensate_all(transfer, &format!("credit failed: {err}"))
                    .await?;
                Ok(StepOutcome::Terminal(transfer))
            }
        }
    }
}

impl TransferSaga<Credited> {
    /// Rebuild a saga at the credited checkpoint from a recovered aggregate.
    pub(crate) fn resume_credited(
        store: DynTransferDatabase,
        account: DynAccountService,
        publisher: DynEventPublisher,
        port_deadline: Duration,
        transfer: Transfer,
    ) -> Self {
        let compensations = compensations_for(&transfer);
        Self {
            store,
            account,
            publisher,
            port_deadline,
            compensations,
            state_data: Credited { transfer },
        }
    }

    /// Terminal checkpoint: persist `COMPLETED` and emit the completion
    /// event. Clears the compensation list; the transfer is done.
    #[instrument(skip_all, fields(reference = %self.state_data.transfer.reference))]
    pub(crate) async fn finalize(mut self) -> Result<Transfer, Error> {
        let mut transfer = self.state_data.transfer.clone();
        transfer.transition(TransferStatus::Completed)?;
        let transfer = self.persist(&transfer).await?;

        self.compensations.clear();
        self.publish(TransferEventKind::Completed, &transfer).await;
        tracing::info!("Transfer {} completed", transfer.reference);
        Ok(transfer)
    }
}

impl<S> TransferSaga<S> {
    /// Persist a checkpoint under optimistic concurrency and continue from
    /// the stored row.
    async fn persist(&self, transfer: &Transfer) -> Result<Transfer, Error> {
        Ok(self.store.update_transfer(transfer).await?)
    }

    /// Apply the per-call deadline to a port operation. An exceeded
    /// deadline counts as unavailability and therefore as step failure.
    async fn with_deadline<T>(
        &self,
        operation: impl Future<Output = Result<T, account::Error>>,
    ) -> Result<T, account::Error> {
        match time::timeout(self.port_deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(account::Error::Unavailable(format!(
                "no response within {}s",
                self.port_deadline.as_secs()
            ))),
        }
    }

    /// Publish after a durable persist. Failures are logged and never roll
    /// back committed state.
    async fn publish(&self, kind: TransferEventKind, transfer: &Transfer) {
        if let Err(err) = self
            .publisher
            .publish(TransferEvent::new(kind, transfer))
            .await
        {
            tracing::error!(
                "Failed to publish {} for {}: {}",
                kind.topic(),
                transfer.reference,
                err
            );
        }
    }

    /// Terminal failure with nothing to undo (validation path).
    async fn fail_without_compensation(
        &self,
        mut transfer: Transfer,
        reason: &str,
    ) -> Result<Transfer, Error> {
        transfer.record_failure(reason);
        transfer.transition(TransferStatus::Failed)?;
        let transfer = self.persist(&transfer).await?;
        self.publish(TransferEventKind::Failed, &transfer).await;
        Ok(transfer)
    }

    /// Execute all compensating actions and consume the saga.
    ///
    /// Walks the executed-steps list in reverse (LIFO). Every action is
    /// attempted even if an earlier one fails; each failure is appended to
    /// the failure reason. All actions succeeding lands on `COMPENSATED`,
    /// anything else on `FAILED` with the aggregate flagged for operator
    /// intervention.
    #[instrument(skip_all)]
    async fn compensate_all(
        mut self,
        mut transfer: Transfer,
        reason: &str,
    ) -> Result<Transfer, Error> {
        transfer.record_failure(reason);
        if transfer.status != TransferStatus::Compensating {
            transfer.transition(TransferStatus::Compensating)?;
        }
        let mut transfer = self.persist(&transfer).await?;

        tracing::warn!(
            "Running {} compensating actions for {}",
            self.compensations.len(),
            transfer.reference
        );

        let mut compensation_errors: Vec<String> = Vec::new();
        while let Some(compensation) = self.compensations.pop_front() {
            tracing::debug!("Running compensation: {}", compensation.name());
            if let Err(err) = self.with_deadline(compensation.execute(&self.account)).await {
                tracing::error!("Compensation {} failed: {}", compensation.name(), err);
                compensation_errors.push(format!("{} failed: {err}", compensation.name()));
            }
        }

        if compensation_errors.is_empty() {
            transfer.transition(TransferStatus::Compensated)?;
            let transfer = self.persist(&transfer).await?;
            self.publish(TransferEventKind::Compensated, &transfer).await;
            Ok(transfer)
        } else {
            for error in &compensation_errors {
                transfer.record_failure(error);
            }
            transfer.transition(TransferStatus::Failed)?;
            let transfer = self.persist(&transfer).await?;
            tracing::error!(
                "Transfer {} could not be compensated; operator intervention required",
                transfer.reference
            );
            self.publish(TransferEventKind::Failed, &transfer).await;
            Ok(transfer)
        }
    }
}
