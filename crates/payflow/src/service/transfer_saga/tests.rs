//! Tests for the transfer saga.
//!
//! This test module covers:
//! - The full success path and its checkpoints
//! - Validation failures and boundary conditions
//! - Compensation on debit and credit failures
//! - Compensation failure and operator flagging
//! - End-to-end idempotency and the insert race
//! - Port deadlines
//! - Recovery of stuck transfers

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use payflow_common::account::AccountStatus;
use payflow_common::event::TransferEventKind;
use payflow_common::{
    Amount, Currency, Transfer, TransferDatabase, TransferReference, TransferRequest,
    TransferStatus,
};
use payflow_fake_account::{CallKind, FakeAccountService, FailureMode};
use payflow_memory::{MemoryIdempotencyCache, MemoryTransferStore};

use crate::pub_sub::{ActiveSubscription, TransferEventBus};
use crate::service::TransferService;
use crate::types::ServiceConfig;

struct TestHarness {
    service: TransferService,
    account: Arc<FakeAccountService>,
    store: Arc<MemoryTransferStore>,
    cache: Arc<MemoryIdempotencyCache>,
    bus: Arc<TransferEventBus>,
}

fn try_currency() -> Currency {
    Currency::new("TRY").unwrap()
}

fn request(amount: Amount) -> TransferRequest {
    TransferRequest::new("ACC-A", "ACC-B", amount, try_currency())
}

async fn setup() -> TestHarness {
    setup_with(FakeAccountService::new(), ServiceConfig::default()).await
}

async fn setup_with(account: FakeAccountService, config: ServiceConfig) -> TestHarness {
    let store = Arc::new(MemoryTransferStore::new());
    let cache = Arc::new(MemoryIdempotencyCache::new());
    let account = Arc::new(account);
    let bus = Arc::new(TransferEventBus::new());
    let service = TransferService::new(
        store.clone(),
        account.clone(),
        cache.clone(),
        bus.clone(),
        config,
    );
    TestHarness {
        service,
        account,
        store,
        cache,
        bus,
    }
}

/// Source funded with 1000.00 TRY, empty destination
async fn fund_accounts(harness: &TestHarness) {
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(1000),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account("ACC-B", Amount::ZERO, try_currency(), AccountStatus::Active)
        .await;
}

fn drain_events(subscription: &mut ActiveSubscription) -> Vec<TransferEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = subscription.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

// ============================================================================
// Success path
// ============================================================================

#[tokio::test]
async fn test_successful_transfer_completes() {
    let harness = setup().await;
    fund_accounts(&harness).await;
    let mut subscription = harness.bus.subscribe_all().await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Completed);
    assert!(snapshot.debit_tx_id.is_some());
    assert!(snapshot.credit_tx_id.is_some());
    assert!(snapshot.completed_at.is_some());
    assert!(snapshot.failure_reason.is_none());

    // Funds moved
    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::from_major(900))
    );
    assert_eq!(
        harness.account.balance(&"ACC-B".into()).await,
        Some(Amount::from_major(100))
    );

    // Exactly one debit then one credit, both keyed by the reference
    let mutations = harness.account.mutation_calls().await;
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[0].kind, CallKind::Debit);
    assert_eq!(mutations[0].account, "ACC-A".into());
    assert_eq!(mutations[0].amount, Some(Amount::from_major(100)));
    assert_eq!(
        mutations[0].client_ref.as_deref(),
        Some(snapshot.reference.as_str())
    );
    assert_eq!(mutations[1].kind, CallKind::Credit);
    assert_eq!(mutations[1].account, "ACC-B".into());
    assert_eq!(
        mutations[1].client_ref.as_deref(),
        Some(snapshot.reference.as_str())
    );

    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Initiated, TransferEventKind::Completed]
    );
}

#[tokio::test]
async fn test_every_checkpoint_bumps_version() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    let stored = harness
        .store
        .get_transfer_by_reference(&snapshot.reference)
        .await
        .unwrap()
        .unwrap();

    // Insert, VALIDATING, DEBIT_PENDING, DEBIT_COMPLETED, CREDIT_PENDING,
    // credit evidence, COMPLETED
    assert_eq!(stored.version, 7);
    assert_eq!(stored.status, TransferStatus::Completed);
}

#[tokio::test]
async fn test_exact_balance_passes_validation() {
    let harness = setup().await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(100),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account("ACC-B", Amount::ZERO, try_currency(), AccountStatus::Active)
        .await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Completed);
    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::ZERO)
    );
}

// ============================================================================
// Validation failures
// ============================================================================

#[tokio::test]
async fn test_insufficient_balance_fails_without_side_effects() {
    let harness = setup().await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(50),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account("ACC-B", Amount::ZERO, try_currency(), AccountStatus::Active)
        .await;
    let mut subscription = harness.bus.subscribe_all().await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("insufficient balance"));

    // No debit or credit was ever attempted
    assert!(harness.account.mutation_calls().await.is_empty());
    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Initiated, TransferEventKind::Failed]
    );
}

#[tokio::test]
async fn test_same_account_fails_before_any_port_call() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    let same = TransferRequest::new("ACC-A", "ACC-A", Amount::from_major(10), try_currency());
    let snapshot = harness.service.initiate(same).await.unwrap();

    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("must differ"));
    // The same-account rule short-circuits even the lookups
    assert!(harness.account.calls().await.is_empty());
}

#[tokio::test]
async fn test_non_positive_amounts_fail_validation() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    for amount in [Amount::ZERO, Amount::from_major(-5)] {
        let snapshot = harness.service.initiate(request(amount)).await.unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(snapshot
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("must be positive"));
    }
    assert!(harness.account.mutation_calls().await.is_empty());
}

#[tokio::test]
async fn test_inactive_accounts_fail_validation() {
    let harness = setup().await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(1000),
            try_currency(),
            AccountStatus::Inactive,
        )
        .await;
    harness
        .account
        .add_account("ACC-B", Amount::ZERO, try_currency(), AccountStatus::Active)
        .await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();
    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("debit account ACC-A is not active"));

    // Destination inactive fails the same way
    let harness = setup().await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(1000),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account(
            "ACC-B",
            Amount::ZERO,
            try_currency(),
            AccountStatus::Frozen,
        )
        .await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();
    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("credit account ACC-B is not active"));
}

#[tokio::test]
async fn test_currency_mismatch_fails_validation() {
    let harness = setup().await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(1000),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account(
            "ACC-B",
            Amount::ZERO,
            Currency::new("USD").unwrap(),
            AccountStatus::Active,
        )
        .await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("does not match transfer currency"));
    assert!(harness.account.mutation_calls().await.is_empty());
}

#[tokio::test]
async fn test_unknown_account_fails_validation() {
    let harness = setup().await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(1000),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    // ACC-B never registered

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("credit account ACC-B not found"));
}

#[tokio::test]
async fn test_unavailable_lookup_fails_validation_without_compensation() {
    let harness = setup().await;
    fund_accounts(&harness).await;
    harness
        .account
        .set_failure(CallKind::Lookup, "ACC-A", FailureMode::Unavailable)
        .await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    // Validation has no side effects, so unavailability lands on FAILED,
    // never on the compensation path
    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("lookup failed"));
    assert!(harness.account.mutation_calls().await.is_empty());
}

// ============================================================================
// Compensation
// ============================================================================

#[tokio::test]
async fn test_credit_failure_compensates_debit() {
    let harness = setup().await;
    fund_accounts(&harness).await;
    harness
        .account
        .set_failure(CallKind::Credit, "ACC-B", FailureMode::Unavailable)
        .await;
    let mut subscription = harness.bus.subscribe_all().await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Compensated);
    assert!(snapshot.debit_tx_id.is_some());
    assert!(snapshot.credit_tx_id.is_none());
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("credit failed"));

    // Net zero once the reversal is applied
    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::from_major(1000))
    );
    assert_eq!(
        harness.account.balance(&"ACC-B".into()).await,
        Some(Amount::ZERO)
    );

    // Forward debit, failed credit, then the reversal under its own ref
    let mutations = harness.account.mutation_calls().await;
    assert_eq!(mutations.len(), 3);
    assert_eq!(mutations[0].kind, CallKind::Debit);
    assert_eq!(mutations[1].kind, CallKind::Credit);
    assert_eq!(mutations[1].account, "ACC-B".into());
    assert_eq!(mutations[2].kind, CallKind::Credit);
    assert_eq!(mutations[2].account, "ACC-A".into());
    assert_eq!(
        mutations[2].client_ref.as_deref(),
        Some(format!("{}-REVERSAL", snapshot.reference).as_str())
    );

    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Initiated, TransferEventKind::Compensated]
    );
}

#[tokio::test]
async fn test_debit_failure_compensates_trivially() {
    let harness = setup().await;
    fund_accounts(&harness).await;
    harness
        .account
        .set_failure(CallKind::Debit, "ACC-A", FailureMode::Unavailable)
        .await;
    let mut subscription = harness.bus.subscribe_all().await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    // Nothing was executed, so the rollback has nothing to reverse
    assert_eq!(snapshot.status, TransferStatus::Compensated);
    assert!(snapshot.debit_tx_id.is_none());

    let mutations = harness.account.mutation_calls().await;
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].kind, CallKind::Debit);

    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::from_major(1000))
    );
    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Initiated, TransferEventKind::Compensated]
    );
}

#[tokio::test]
async fn test_failed_compensation_flags_transfer() {
    let harness = setup().await;
    fund_accounts(&harness).await;
    // Forward credit fails and so does the reversal credit
    harness
        .account
        .set_failure(CallKind::Credit, "ACC-B", FailureMode::Unavailable)
        .await;
    harness
        .account
        .set_failure(CallKind::Credit, "ACC-A", FailureMode::Unavailable)
        .await;
    let mut subscription = harness.bus.subscribe_all().await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    assert_eq!(snapshot.status, TransferStatus::Failed);
    let reason = snapshot.failure_reason.as_deref().unwrap();
    assert!(reason.contains("credit failed"));
    assert!(reason.contains("ReverseDebit failed"));

    // The debit stands until an operator steps in
    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::from_major(900))
    );

    // A single terminal event
    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Initiated, TransferEventKind::Failed]
    );
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_duplicate_key_returns_identical_snapshot() {
    let harness = setup().await;
    fund_accounts(&harness).await;
    let mut subscription = harness.bus.subscribe_all().await;

    let deduped = request(Amount::from_major(100)).with_idempotency_key("K1");
    let first = harness.service.initiate(deduped.clone()).await.unwrap();
    let second = harness.service.initiate(deduped.clone()).await.unwrap();

    assert_eq!(first.status, TransferStatus::Completed);
    assert_eq!(first, second);

    // One aggregate, one debit, one credit, events emitted once
    assert_eq!(harness.account.mutation_calls().await.len(), 2);
    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Initiated, TransferEventKind::Completed]
    );

    // A lost cache still dedups through the store
    harness.cache.clear().await;
    let third = harness.service.initiate(deduped).await.unwrap();
    assert_eq!(first, third);
    assert_eq!(harness.account.mutation_calls().await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_duplicates_create_one_aggregate() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    let deduped = request(Amount::from_major(100)).with_idempotency_key("K2");
    let (first, second) = tokio::join!(
        harness.service.initiate(deduped.clone()),
        harness.service.initiate(deduped.clone())
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.reference, second.reference);
    // Exactly one saga ran
    assert_eq!(harness.account.mutation_calls().await.len(), 2);
    let stored = harness
        .store
        .get_transfer_by_idempotency_key("K2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.reference, first.reference);
}

#[tokio::test]
async fn test_requests_without_key_are_never_deduplicated() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    let first = harness
        .service
        .initiate(request(Amount::from_major(10)))
        .await
        .unwrap();
    let second = harness
        .service
        .initiate(request(Amount::from_major(10)))
        .await
        .unwrap();

    assert_ne!(first.reference, second.reference);
    assert_eq!(harness.account.mutation_calls().await.len(), 4);
}

// ============================================================================
// Bad requests and deadlines
// ============================================================================

#[tokio::test]
async fn test_bad_request_creates_no_aggregate() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    let bad = request(Amount::from_major(10)).with_description("d".repeat(501));
    assert!(harness.service.initiate(bad).await.is_err());

    assert!(harness
        .service
        .transfers_from(&"ACC-A".into())
        .await
        .unwrap()
        .is_empty());
    assert!(harness.account.calls().await.is_empty());
}

#[tokio::test]
async fn test_port_deadline_counts_as_step_failure() {
    let slow = FakeAccountService::new().with_response_delay(Duration::from_millis(200));
    let config = ServiceConfig {
        port_deadline: Duration::from_millis(50),
        ..ServiceConfig::default()
    };
    let harness = setup_with(slow, config).await;
    fund_accounts(&harness).await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    // The first lookup already exceeds the deadline, so validation fails
    assert_eq!(snapshot.status, TransferStatus::Failed);
    assert!(snapshot
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("lookup failed"));
}

// ============================================================================
// Read surface
// ============================================================================

#[tokio::test]
async fn test_read_surface() {
    let harness = setup().await;
    fund_accounts(&harness).await;

    let snapshot = harness
        .service
        .initiate(request(Amount::from_major(100)))
        .await
        .unwrap();

    let fetched = harness
        .service
        .get_transfer(&snapshot.reference)
        .await
        .unwrap();
    assert_eq!(fetched, snapshot);

    assert_eq!(
        harness
            .service
            .transfers_from(&"ACC-A".into())
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        harness
            .service
            .transfers_to(&"ACC-B".into())
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        harness
            .service
            .transfers_for_account(&"ACC-B".into())
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(harness
        .service
        .get_transfer(&TransferReference::from("TXF-MISSING00000"))
        .await
        .is_err());
}

// ============================================================================
// Recovery
// ============================================================================

fn recovery_config() -> ServiceConfig {
    ServiceConfig {
        // Everything non-terminal counts as stuck immediately
        stuck_threshold: Duration::ZERO,
        ..ServiceConfig::default()
    }
}

#[tokio::test]
async fn test_recovery_expires_stale_pending() {
    let harness = setup_with(FakeAccountService::new(), recovery_config()).await;
    let mut subscription = harness.bus.subscribe_all().await;

    let transfer = Transfer::new(
        TransferReference::generate(),
        &request(Amount::from_major(100)),
    );
    harness.store.add_transfer(transfer.clone()).await.unwrap();

    let report = harness.service.startup_check().await.unwrap();
    assert_eq!(report.expired, 1);

    let stored = harness
        .store
        .get_transfer_by_reference(&transfer.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransferStatus::Failed);
    assert!(stored
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("expired"));
    assert_eq!(
        drain_events(&mut subscription),
        vec![TransferEventKind::Failed]
    );
}

#[tokio::test]
async fn test_recovery_resumes_from_debited_checkpoint() {
    let harness = setup_with(FakeAccountService::new(), recovery_config()).await;
    // Balances as they stood after the crash: the debit already landed
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(900),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account("ACC-B", Amount::ZERO, try_currency(), AccountStatus::Active)
        .await;

    let mut transfer = Transfer::new(
        TransferReference::generate(),
        &request(Amount::from_major(100)),
    );
    harness.store.add_transfer(transfer.clone()).await.unwrap();
    transfer.transition(TransferStatus::Validating).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.transition(TransferStatus::DebitPending).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.record_debit("D1".to_string());
    transfer.transition(TransferStatus::DebitCompleted).unwrap();
    let transfer = harness.store.update_transfer(&transfer).await.unwrap();

    let report = harness.service.startup_check().await.unwrap();
    assert_eq!(report.resumed, 1);

    let stored = harness
        .store
        .get_transfer_by_reference(&transfer.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransferStatus::Completed);
    assert!(stored.credit_tx_id.is_some());
    assert_eq!(
        harness.account.balance(&"ACC-B".into()).await,
        Some(Amount::from_major(100))
    );
}

#[tokio::test]
async fn test_recovery_resumes_interrupted_compensation() {
    let harness = setup_with(FakeAccountService::new(), recovery_config()).await;
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(900),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account("ACC-B", Amount::ZERO, try_currency(), AccountStatus::Active)
        .await;

    let mut transfer = Transfer::new(
        TransferReference::generate(),
        &request(Amount::from_major(100)),
    );
    harness.store.add_transfer(transfer.clone()).await.unwrap();
    transfer.transition(TransferStatus::Validating).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.transition(TransferStatus::DebitPending).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.record_debit("D1".to_string());
    transfer.transition(TransferStatus::DebitCompleted).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.transition(TransferStatus::CreditPending).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.record_failure("credit failed: account service unavailable");
    transfer.transition(TransferStatus::Compensating).unwrap();
    let transfer = harness.store.update_transfer(&transfer).await.unwrap();

    let report = harness.service.startup_check().await.unwrap();
    assert_eq!(report.compensated, 1);

    let stored = harness
        .store
        .get_transfer_by_reference(&transfer.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransferStatus::Compensated);

    // The recorded debit was reversed under the reversal ref
    let mutations = harness.account.mutation_calls().await;
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].kind, CallKind::Credit);
    assert_eq!(mutations[0].account, "ACC-A".into());
    assert_eq!(
        mutations[0].client_ref.as_deref(),
        Some(transfer.reference.reversal_ref().as_str())
    );
    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::from_major(1000))
    );
}

#[tokio::test]
async fn test_recovery_reverses_both_steps_in_lifo_order() {
    let harness = setup_with(FakeAccountService::new(), recovery_config()).await;
    // Both mutations landed before the compensation run was interrupted
    harness
        .account
        .add_account(
            "ACC-A",
            Amount::from_major(900),
            try_currency(),
            AccountStatus::Active,
        )
        .await;
    harness
        .account
        .add_account(
            "ACC-B",
            Amount::from_major(100),
            try_currency(),
            AccountStatus::Active,
        )
        .await;

    let mut transfer = Transfer::new(
        TransferReference::generate(),
        &request(Amount::from_major(100)),
    );
    harness.store.add_transfer(transfer.clone()).await.unwrap();
    transfer.transition(TransferStatus::Validating).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.transition(TransferStatus::DebitPending).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.record_debit("D1".to_string());
    transfer.transition(TransferStatus::DebitCompleted).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.transition(TransferStatus::CreditPending).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.record_credit("C1".to_string());
    transfer.record_failure("finalization rejected by operator");
    transfer.transition(TransferStatus::Compensating).unwrap();
    let transfer = harness.store.update_transfer(&transfer).await.unwrap();

    let report = harness.service.startup_check().await.unwrap();
    assert_eq!(report.compensated, 1);

    // Credit reversed before debit, both under the reversal ref
    let reversal_ref = transfer.reference.reversal_ref();
    let mutations = harness.account.mutation_calls().await;
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[0].kind, CallKind::Debit);
    assert_eq!(mutations[0].account, "ACC-B".into());
    assert_eq!(mutations[0].client_ref.as_deref(), Some(reversal_ref.as_str()));
    assert_eq!(mutations[1].kind, CallKind::Credit);
    assert_eq!(mutations[1].account, "ACC-A".into());
    assert_eq!(mutations[1].client_ref.as_deref(), Some(reversal_ref.as_str()));

    // Net zero restored on both sides
    assert_eq!(
        harness.account.balance(&"ACC-A".into()).await,
        Some(Amount::from_major(1000))
    );
    assert_eq!(
        harness.account.balance(&"ACC-B".into()).await,
        Some(Amount::ZERO)
    );
}

#[tokio::test]
async fn test_recovery_flags_unknowable_outcomes() {
    let harness = setup_with(FakeAccountService::new(), recovery_config()).await;

    let mut transfer = Transfer::new(
        TransferReference::generate(),
        &request(Amount::from_major(100)),
    );
    harness.store.add_transfer(transfer.clone()).await.unwrap();
    transfer.transition(TransferStatus::Validating).unwrap();
    let mut transfer = harness.store.update_transfer(&transfer).await.unwrap();
    transfer.transition(TransferStatus::DebitPending).unwrap();
    let transfer = harness.store.update_transfer(&transfer).await.unwrap();

    let report = harness.service.startup_check().await.unwrap();
    assert_eq!(report.flagged, 1);

    // Never guessed at: the row is untouched
    let stored = harness
        .store
        .get_transfer_by_reference(&transfer.reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransferStatus::DebitPending);
    assert!(harness.account.mutation_calls().await.is_empty());
}
