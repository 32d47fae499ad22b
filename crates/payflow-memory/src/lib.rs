//! In-memory implementations of the payflow store and idempotency cache,
//! mainly for testing and development.
//!
//! The store enforces the same contract a SQL backend would: unique indices
//! on `reference` and `idempotency_key`, and optimistic concurrency on
//! `version`.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use payflow_common::cache::{self, IdempotencyCache};
use payflow_common::database::{self, TransferDatabase};
use payflow_common::util::unix_time;
use payflow_common::{AccountId, Transfer, TransferReference};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StoreInner {
    transfers: HashMap<TransferReference, Transfer>,
    by_idempotency_key: HashMap<String, TransferReference>,
}

/// In-memory transfer store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransferStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryTransferStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut transfers: Vec<Transfer>) -> Vec<Transfer> {
        transfers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        transfers
    }
}

#[async_trait]
impl TransferDatabase for MemoryTransferStore {
    async fn add_transfer(&self, transfer: Transfer) -> Result<(), database::Error> {
        let mut inner = self.inner.write().await;
        if inner.transfers.contains_key(&transfer.reference) {
            return Err(database::Error::Duplicate);
        }
        if let Some(key) = &transfer.idempotency_key {
            if inner.by_idempotency_key.contains_key(key) {
                return Err(database::Error::DuplicateIdempotencyKey);
            }
            inner
                .by_idempotency_key
                .insert(key.clone(), transfer.reference.clone());
        }
        inner.transfers.insert(transfer.reference.clone(), transfer);
        Ok(())
    }

    async fn update_transfer(&self, transfer: &Transfer) -> Result<Transfer, database::Error> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .transfers
            .get_mut(&transfer.reference)
            .ok_or(database::Error::UnknownTransfer)?;
        if stored.version != transfer.version {
            return Err(database::Error::ConcurrentModification);
        }
        let mut persisted = transfer.clone();
        persisted.version += 1;
        *stored = persisted.clone();
        Ok(persisted)
    }

    async fn get_transfer_by_reference(
        &self,
        reference: &TransferReference,
    ) -> Result<Option<Transfer>, database::Error> {
        Ok(self.inner.read().await.transfers.get(reference).cloned())
    }

    async fn get_transfer_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Transfer>, database::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_idempotency_key
            .get(idempotency_key)
            .and_then(|reference| inner.transfers.get(reference))
            .cloned())
    }

    async fn get_transfers_by_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<Transfer>, database::Error> {
        let inner = self.inner.read().await;
        Ok(Self::sorted(
            inner
                .transfers
                .values()
                .filter(|t| &t.from_account == account_id || &t.to_account == account_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_transfers_from(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<Transfer>, database::Error> {
        let inner = self.inner.read().await;
        Ok(Self::sorted(
            inner
                .transfers
                .values()
                .filter(|t| &t.from_account == account_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_transfers_to(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<Transfer>, database::Error> {
        let inner = self.inner.read().await;
        Ok(Self::sorted(
            inner
                .transfers
                .values()
                .filter(|t| &t.to_account == account_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_stuck_transfers(
        &self,
        older_than: Duration,
    ) -> Result<Vec<Transfer>, database::Error> {
        let cutoff = unix_time().saturating_sub(older_than.as_secs());
        let inner = self.inner.read().await;
        Ok(Self::sorted(
            inner
                .transfers
                .values()
                .filter(|t| !t.is_terminal() && t.updated_at <= cutoff)
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Debug)]
struct CacheEntry {
    reference: TransferReference,
    expires_at: u64,
}

/// In-memory TTL idempotency cache.
///
/// Expired entries are treated as misses and dropped on read.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdempotencyCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryIdempotencyCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry, simulating a cache restart
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn get(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransferReference>, cache::Error> {
        let now = unix_time();
        {
            let entries = self.entries.read().await;
            match entries.get(idempotency_key) {
                Some(entry) if entry.expires_at > now => {
                    return Ok(Some(entry.reference.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(idempotency_key);
        Ok(None)
    }

    async fn put(
        &self,
        idempotency_key: &str,
        reference: &TransferReference,
        ttl: Duration,
    ) -> Result<(), cache::Error> {
        let entry = CacheEntry {
            reference: reference.clone(),
            expires_at: unix_time().saturating_add(ttl.as_secs()),
        };
        self.entries
            .write()
            .await
            .insert(idempotency_key.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use payflow_common::{Amount, Currency, TransferRequest, TransferStatus};

    use super::*;

    fn test_transfer(idempotency_key: Option<&str>) -> Transfer {
        let mut request = TransferRequest::new(
            "ACC-A",
            "ACC-B",
            Amount::from_major(100),
            Currency::new("TRY").unwrap(),
        );
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }
        Transfer::new(TransferReference::generate(), &request)
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected() {
        let store = MemoryTransferStore::new();
        let transfer = test_transfer(None);
        store.add_transfer(transfer.clone()).await.unwrap();
        assert!(matches!(
            store.add_transfer(transfer).await,
            Err(database::Error::Duplicate)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected() {
        let store = MemoryTransferStore::new();
        store.add_transfer(test_transfer(Some("K1"))).await.unwrap();
        assert!(matches!(
            store.add_transfer(test_transfer(Some("K1"))).await,
            Err(database::Error::DuplicateIdempotencyKey)
        ));
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = MemoryTransferStore::new();
        let mut transfer = test_transfer(None);
        store.add_transfer(transfer.clone()).await.unwrap();

        transfer.transition(TransferStatus::Validating).unwrap();
        let persisted = store.update_transfer(&transfer).await.unwrap();
        assert_eq!(persisted.version, 2);

        // Writer still holding version 1 loses
        assert!(matches!(
            store.update_transfer(&transfer).await,
            Err(database::Error::ConcurrentModification)
        ));
    }

    #[tokio::test]
    async fn test_lookup_by_idempotency_key() {
        let store = MemoryTransferStore::new();
        let transfer = test_transfer(Some("K2"));
        store.add_transfer(transfer.clone()).await.unwrap();

        let found = store
            .get_transfer_by_idempotency_key("K2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.reference, transfer.reference);
        assert!(store
            .get_transfer_by_idempotency_key("K3")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_account_queries() {
        let store = MemoryTransferStore::new();
        let transfer = test_transfer(None);
        store.add_transfer(transfer.clone()).await.unwrap();

        let from = AccountId::from("ACC-A");
        let to = AccountId::from("ACC-B");
        let other = AccountId::from("ACC-C");

        assert_eq!(store.get_transfers_from(&from).await.unwrap().len(), 1);
        assert_eq!(store.get_transfers_to(&to).await.unwrap().len(), 1);
        assert_eq!(store.get_transfers_by_account(&from).await.unwrap().len(), 1);
        assert_eq!(store.get_transfers_by_account(&to).await.unwrap().len(), 1);
        assert!(store.get_transfers_by_account(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_transfers_excludes_terminal() {
        let store = MemoryTransferStore::new();
        let pending = test_transfer(None);
        store.add_transfer(pending.clone()).await.unwrap();

        let mut failed = test_transfer(None);
        store.add_transfer(failed.clone()).await.unwrap();
        failed.transition(TransferStatus::Validating).unwrap();
        let mut failed = store.update_transfer(&failed).await.unwrap();
        failed.transition(TransferStatus::Failed).unwrap();
        store.update_transfer(&failed).await.unwrap();

        let stuck = store.get_stuck_transfers(Duration::ZERO).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].reference, pending.reference);

        let stuck = store
            .get_stuck_transfers(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(stuck.is_empty());
    }

    #[tokio::test]
    async fn test_cache_round_trip_and_expiry() {
        let cache = MemoryIdempotencyCache::new();
        let reference = TransferReference::generate();

        cache
            .put("K1", &reference, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(cache.get("K1").await.unwrap(), Some(reference.clone()));

        // Zero TTL entries are already expired
        cache.put("K2", &reference, Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("K2").await.unwrap(), None);

        cache.clear().await;
        assert_eq!(cache.get("K1").await.unwrap(), None);
    }
}
