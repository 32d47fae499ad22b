//! Transfer orchestration service.
//!
//! [`TransferService`] composes the four collaborators — account port,
//! transfer store, idempotency cache, event publisher — as explicit trait
//! objects and drives the saga. All mutable state lives on the transfer
//! aggregate, serialized through the store's optimistic concurrency; the
//! service itself is cheap to clone and safe to share across tasks.

use payflow_common::database;
use payflow_common::event::TransferEventKind;
use payflow_common::{
    AccountId, DynAccountService, DynEventPublisher, DynIdempotencyCache, DynTransferDatabase,
    Error, Transfer, TransferEvent, TransferReference, TransferRequest, TransferSnapshot,
};
use tracing::instrument;

use crate::types::ServiceConfig;
use self::transfer_saga::state::StepOutcome;
use self::transfer_saga::TransferSaga;

mod builder;
mod recovery;
mod transfer_saga;

pub use builder::TransferServiceBuilder;
pub use recovery::RecoveryReport;

/// The transfer orchestrator.
#[derive(Clone)]
pub struct TransferService {
    store: DynTransferDatabase,
    account: DynAccountService,
    cache: DynIdempotencyCache,
    publisher: DynEventPublisher,
    config: ServiceConfig,
}

/// How an aggregate came to exist for a request.
enum CreateOutcome {
    /// A fresh aggregate was inserted for this request
    Created(Transfer),
    /// A concurrent request with the same idempotency key won the insert
    Deduplicated(Transfer),
}

impl TransferService {
    /// Create a new [`TransferService`]
    pub fn new(
        store: DynTransferDatabase,
        account: DynAccountService,
        cache: DynIdempotencyCache,
        publisher: DynEventPublisher,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            account,
            cache,
            publisher,
            config,
        }
    }

    /// Builder-style construction
    pub fn builder() -> TransferServiceBuilder {
        TransferServiceBuilder::default()
    }

    /// Initiate a transfer and drive it to a terminal state.
    ///
    /// Structurally malformed requests are rejected before any aggregate
    /// exists. A request carrying an already-seen idempotency key returns
    /// the prior aggregate unchanged, without emitting events. Otherwise
    /// the aggregate is persisted `PENDING`, `transfer.initiated` is
    /// emitted, and the saga runs; the returned snapshot carries the
    /// terminal status and any accumulated failure reason.
    #[instrument(skip_all, fields(
        from = %request.from_account,
        to = %request.to_account,
        amount = %request.amount
    ))]
    pub async fn initiate(&self, request: TransferRequest) -> Result<TransferSnapshot, Error> {
        request.validate()?;

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.find_existing(key).await? {
                tracing::info!(
                    "Duplicate request for idempotency key, returning transfer {}",
                    existing.reference
                );
                return Ok(TransferSnapshot::from(&existing));
            }
        }

        let transfer = match self.create_transfer(&request).await? {
            CreateOutcome::Deduplicated(existing) => {
                tracing::info!(
                    "Lost idempotency insert race, returning transfer {}",
                    existing.reference
                );
                return Ok(TransferSnapshot::from(&existing));
            }
            CreateOutcome::Created(transfer) => transfer,
        };

        if let Some(key) = &transfer.idempotency_key {
            if let Err(err) = self
                .cache
                .put(key, &transfer.reference, self.config.idempotency_ttl)
                .await
            {
                tracing::warn!("Failed to cache idempotency mapping: {err}");
            }
        }

        self.publish(TransferEventKind::Initiated, &transfer).await;

        let transfer = self.execute_saga(transfer).await?;
        Ok(TransferSnapshot::from(&transfer))
    }

    /// Snapshot of a single transfer
    pub async fn get_transfer(
        &self,
        reference: &TransferReference,
    ) -> Result<TransferSnapshot, Error> {
        self.store
            .get_transfer_by_reference(reference)
            .await?
            .map(|t| TransferSnapshot::from(&t))
            .ok_or_else(|| Error::UnknownTransfer(reference.to_string()))
    }

    /// Transfers debiting or crediting an account
    pub async fn transfers_for_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<TransferSnapshot>, Error> {
        Ok(snapshots(
            self.store.get_transfers_by_account(account_id).await?,
        ))
    }

    /// Transfers debiting an account
    pub async fn transfers_from(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<TransferSnapshot>, Error> {
        Ok(snapshots(self.store.get_transfers_from(account_id).await?))
    }

    /// Transfers crediting an account
    pub async fn transfers_to(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<TransferSnapshot>, Error> {
        Ok(snapshots(self.store.get_transfers_to(account_id).await?))
    }

    /// Non-terminal transfers older than the configured stuck threshold
    pub async fn stuck_transfers(&self) -> Result<Vec<TransferSnapshot>, Error> {
        Ok(snapshots(
            self.store
                .get_stuck_transfers(self.config.stuck_threshold)
                .await?,
        ))
    }

    /// Two-tier lookup: cache first, store as the authority.
    async fn find_existing(&self, idempotency_key: &str) -> Result<Option<Transfer>, Error> {
        match self.cache.get(idempotency_key).await {
            Ok(Some(reference)) => {
                match self.store.get_transfer_by_reference(&reference).await? {
                    Some(transfer) => return Ok(Some(transfer)),
                    // The cache may not invent mappings; distrust it and
                    // fall through to the store
                    None => tracing::warn!(
                        "Idempotency cache mapped key to unknown transfer {}",
                        reference
                    ),
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("Idempotency cache lookup failed: {err}"),
        }

        if let Some(transfer) = self
            .store
            .get_transfer_by_idempotency_key(idempotency_key)
            .await?
        {
            if let Err(err) = self
                .cache
                .put(
                    idempotency_key,
                    &transfer.reference,
                    self.config.idempotency_ttl,
                )
                .await
            {
                tracing::warn!("Failed to repopulate idempotency cache: {err}");
            }
            return Ok(Some(transfer));
        }

        Ok(None)
    }

    /// Insert a fresh `PENDING` aggregate, regenerating the reference on a
    /// uniqueness collision up to the configured bound.
    async fn create_transfer(&self, request: &TransferRequest) -> Result<CreateOutcome, Error> {
        let mut attempts = 0;
        loop {
            let transfer = Transfer::new(TransferReference::generate(), request);
            match self.store.add_transfer(transfer.clone()).await {
                Ok(()) => return Ok(CreateOutcome::Created(transfer)),
                Err(database::Error::Duplicate) => {
                    attempts += 1;
                    if attempts >= self.config.reference_retries {
                        return Err(Error::ReferenceExhausted);
                    }
                    tracing::warn!(
                        "Transfer reference collision, regenerating (attempt {attempts})"
                    );
                }
                Err(database::Error::DuplicateIdempotencyKey) => {
                    // A concurrent initiate with the same key persisted
                    // first; the unique index is the invariant backstop
                    if let Some(key) = &request.idempotency_key {
                        if let Some(existing) =
                            self.store.get_transfer_by_idempotency_key(key).await?
                        {
                            return Ok(CreateOutcome::Deduplicated(existing));
                        }
                    }
                    return Err(database::Error::DuplicateIdempotencyKey.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Drive the forward saga to a terminal state.
    async fn execute_saga(&self, transfer: Transfer) -> Result<Transfer, Error> {
        let saga = TransferSaga::new(
            self.store.clone(),
            self.account.clone(),
            self.publisher.clone(),
            self.config.port_deadline,
            transfer,
        );

        let saga = match saga.validate().await? {
            StepOutcome::Advanced(saga) => saga,
            StepOutcome::Terminal(transfer) => return Ok(transfer),
        };
        let saga = match saga.debit().await? {
            StepOutcome::Advanced(saga) => saga,
            StepOutcome::Terminal(transfer) => return Ok(transfer),
        };
        let saga = match saga.credit().await? {
            StepOutcome::Advanced(saga) => saga,
            StepOutcome::Terminal(transfer) => return Ok(transfer),
        };
        saga.finalize().await
    }

    /// Publish after a durable persist; failures are logged, never raised.
    pub(crate) async fn publish(&self, kind: TransferEventKind, transfer: &Transfer) {
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
}

fn snapshots(transfers: Vec<Transfer>) -> Vec<TransferSnapshot> {
    transfers.iter().map(TransferSnapshot::from).collect()
}
