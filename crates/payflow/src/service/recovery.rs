//! Recovery pass for stuck transfers.
//!
//! The forward saga persists a checkpoint before and after every step, so a
//! crash leaves a record whose status and recorded transaction ids say
//! exactly how far execution got. This pass walks every non-terminal
//! transfer older than the stuck threshold and resolves the ones whose
//! evidence is conclusive:
//!
//! - `PENDING`/`VALIDATING`: no step ran, nothing to undo — mark `FAILED`.
//! - `DEBIT_COMPLETED`: the debit landed and the credit was never attempted;
//!   resume forward (the port is idempotent on the transfer reference, so a
//!   repeated credit cannot double-apply).
//! - `CREDIT_PENDING` with a recorded credit transaction id: both mutations
//!   landed, only the terminal checkpoint is missing — finalize.
//! - `COMPENSATING`: re-run the compensators derived from the recorded
//!   transaction ids.
//!
//! `DEBIT_PENDING`, and `CREDIT_PENDING` without credit evidence, mean a
//! port call was in flight when the process died and its outcome is
//! unknowable from the checkpoint alone; those are flagged for operator
//! intervention rather than guessed at.

use payflow_common::database;
use payflow_common::event::TransferEventKind;
use payflow_common::{Error, Transfer, TransferStatus};
use tracing::instrument;

use super::transfer_saga::state::StepOutcome;
use super::transfer_saga::TransferSaga;
use super::TransferService;

/// Outcome counts of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transfers failed because they never reached their first step
    pub expired: usize,
    /// Transfers resumed forward and completed
    pub resumed: usize,
    /// Transfers rolled back to `COMPENSATED`
    pub compensated: usize,
    /// Transfers whose compensation failed, terminal `FAILED`
    pub failed: usize,
    /// Transfers left for operator intervention
    pub flagged: usize,
}

enum Disposition {
    Expired,
    Resumed,
    Compensated,
    Failed,
    Flagged,
}

impl TransferService {
    /// Resolve stuck transfers left behind by crashes or lost tasks.
    ///
    /// Intended to run at service start and periodically thereafter. A
    /// transfer that loses an optimistic-concurrency race during the pass is
    /// being advanced by a live task and is skipped.
    #[instrument(skip_all)]
    pub async fn startup_check(&self) -> Result<RecoveryReport, Error> {
        let stuck = self
            .store
            .get_stuck_transfers(self.config.stuck_threshold)
            .await?;
        tracing::info!("There are {} stuck transfers.", stuck.len());

        let mut report = RecoveryReport::default();
        for transfer in stuck {
            let reference = transfer.reference.clone();
            match self.recover_one(transfer).await {
                Ok(Disposition::Expired) => report.expired += 1,
                Ok(Disposition::Resumed) => report.resumed += 1,
                Ok(Disposition::Compensated) => report.compensated += 1,
                Ok(Disposition::Failed) => report.failed += 1,
                Ok(Disposition::Flagged) => report.flagged += 1,
                Err(Error::Database(database::Error::ConcurrentModification)) => {
                    tracing::warn!("Transfer {} is being advanced elsewhere, skipping", reference);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }

    async fn recover_one(&self, transfer: Transfer) -> Result<Disposition, Error> {
        match transfer.status {
            TransferStatus::Pending | TransferStatus::Validating => {
                self.expire_stale(transfer).await?;
                Ok(Disposition::Expired)
            }
            TransferStatus::DebitCompleted => {
                tracing::info!(
                    "Resuming transfer {} from the debited checkpoint",
                    transfer.reference
                );
                let saga = TransferSaga::resume_debited(
                    self.store.clone(),
                    self.account.clone(),
                    self.publisher.clone(),
                    self.config.port_deadline,
                    transfer,
                );
                let transfer = match saga.credit().await? {
                    StepOutcome::Advanced(saga) => saga.finalize().await?,
                    StepOutcome::Terminal(transfer) => transfer,
                };
                Ok(terminal_disposition(&transfer))
            }
            TransferStatus::CreditPending if transfer.credit_tx_id.is_some() => {
                tracing::info!(
                    "Finalizing transfer {} with durable credit evidence",
                    transfer.reference
                );
                let saga = TransferSaga::resume_credited(
                    self.store.clone(),
                    self.account.clone(),
                    self.publisher.clone(),
                    self.config.port_deadline,
                    transfer,
                );
                let transfer = saga.finalize().await?;
                Ok(terminal_disposition(&transfer))
            }
            TransferStatus::Compensating => {
                tracing::info!("Resuming compensation for transfer {}", transfer.reference);
                let saga = TransferSaga::resume(
                    self.store.clone(),
                    self.account.clone(),
                    self.publisher.clone(),
                    self.config.port_deadline,
                    transfer,
                );
                let transfer = saga
                    .run_compensation("resumed compensation after restart")
                    .await?;
                Ok(terminal_disposition(&transfer))
            }
            TransferStatus::DebitPending | TransferStatus::CreditPending => {
                tracing::error!(
                    "Transfer {} stuck in {} with an in-flight port call of unknown outcome; \
                     operator intervention required",
                    transfer.reference,
                    transfer.status
                );
                Ok(Disposition::Flagged)
            }
            TransferStatus::Completed | TransferStatus::Compensated | TransferStatus::Failed => {
                // Terminal rows are filtered by the store query
                Ok(Disposition::Flagged)
            }
        }
    }

    async fn expire_stale(&self, mut transfer: Transfer) -> Result<(), Error> {
        tracing::warn!(
            "Expiring stale transfer {} stuck in {}",
            transfer.reference,
            transfer.status
        );
        transfer.record_failure("expired before execution started");
        transfer.transition(TransferStatus::Failed)?;
        let transfer = self.store.update_transfer(&transfer).await?;
        self.publish(TransferEventKind::Failed, &transfer).await;
        Ok(())
    }
}

fn terminal_disposition(transfer: &Transfer) -> Disposition {
    match transfer.status {
        TransferStatus::Completed => Disposition::Resumed,
        TransferStatus::Compensated => Disposition::Compensated,
        _ => Disposition::Failed,
    }
}
