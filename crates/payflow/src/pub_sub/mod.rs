//! In-process publish–subscribe delivery of transfer events.
//!
//! Stands in for the message bus: subscribers register for every event or
//! for a single transfer reference (the partition key) and receive events in
//! emission order over `mpsc` channels. Because the orchestrator awaits each
//! publish after the corresponding persist, a subscriber observes a prefix
//! of the canonical state-transition order for any one reference.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;

use async_trait::async_trait;
use payflow_common::event::{self, EventPublisher, TransferEvent};
use payflow_common::TransferReference;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Default per-subscriber channel capacity
pub const DEFAULT_CHANNEL_SIZE: usize = 32;

/// Size of the unsubscription channel
const DEFAULT_REMOVE_SIZE: usize = 10_000;

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubscriptionKey {
    /// Every event on the bus
    All,
    /// Only events for one transfer reference
    Reference(TransferReference),
}

type SubscriberTree =
    Arc<RwLock<BTreeMap<(SubscriptionKey, usize), mpsc::Sender<TransferEvent>>>>;

/// In-process transfer event bus.
///
/// Keeps track of all subscription listeners and broadcasts events to them.
/// A lagging subscriber (full channel) loses events rather than blocking the
/// orchestrator; the bus itself never fails a publish.
#[derive(Debug)]
pub struct TransferEventBus {
    subscribers: SubscriberTree,
    next_id: AtomicUsize,
    unsubscription_sender: mpsc::Sender<(SubscriptionKey, usize)>,
    active_subscriptions: Arc<AtomicUsize>,
    background_subscription_remover: Option<JoinHandle<()>>,
}

impl Default for TransferEventBus {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel(DEFAULT_REMOVE_SIZE);
        let active_subscriptions: Arc<AtomicUsize> = Default::default();
        let subscribers: SubscriberTree = Arc::new(Default::default());

        Self {
            background_subscription_remover: Some(tokio::spawn(Self::remove_subscription(
                receiver,
                subscribers.clone(),
                active_subscriptions.clone(),
            ))),
            subscribers,
            next_id: AtomicUsize::new(0),
            unsubscription_sender: sender,
            active_subscriptions,
        }
    }
}

impl TransferEventBus {
    /// Create a new bus.
    ///
    /// Must be called from within a tokio runtime; the bus spawns a
    /// background task that cleans up dropped subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event on the bus
    pub async fn subscribe_all(&self) -> ActiveSubscription {
        self.subscribe_inner(SubscriptionKey::All).await
    }

    /// Subscribe to events for a single transfer reference
    pub async fn subscribe_reference(&self, reference: TransferReference) -> ActiveSubscription {
        self.subscribe_inner(SubscriptionKey::Reference(reference))
            .await
    }

    /// Number of live subscriptions
    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(atomic::Ordering::SeqCst)
    }

    async fn subscribe_inner(&self, key: SubscriptionKey) -> ActiveSubscription {
        let (sender, receiver) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let id = self.next_id.fetch_add(1, atomic::Ordering::Relaxed);

        self.subscribers
            .write()
            .await
            .insert((key.clone(), id), sender);
        self.active_subscriptions
            .fetch_add(1, atomic::Ordering::Relaxed);

        ActiveSubscription {
            key,
            id,
            receiver,
            drop: self.unsubscription_sender.clone(),
        }
    }

    /// Deliver an event to all matching subscribers, in registration order.
    pub async fn broadcast(&self, event: TransferEvent) {
        let subscribers = self.subscribers.read().await;
        let all = subscribers.range(
            (SubscriptionKey::All, 0)..=(SubscriptionKey::All, usize::MAX),
        );
        let key = SubscriptionKey::Reference(event.partition_key().clone());
        let by_reference = subscribers.range((key.clone(), 0)..=(key, usize::MAX));

        for ((_, id), sender) in all.chain(by_reference) {
            if sender.try_send(event.clone()).is_err() {
                tracing::warn!(
                    "Subscriber {} lagging or gone, dropping {}",
                    id,
                    event.topic()
                );
            }
        }
    }

    /// Background task removing dropped subscriptions from the tree.
    async fn remove_subscription(
        mut receiver: mpsc::Receiver<(SubscriptionKey, usize)>,
        subscribers: SubscriberTree,
        active_subscriptions: Arc<AtomicUsize>,
    ) {
        while let Some((key, id)) = receiver.recv().await {
            tracing::debug!("Removing subscription {}", id);
            active_subscriptions.fetch_sub(1, atomic::Ordering::AcqRel);
            subscribers.write().await.remove(&(key, id));
        }
    }
}

/// Bus goes out of scope, stop the background task
impl Drop for TransferEventBus {
    fn drop(&mut self) {
        if let Some(handle) = self.background_subscription_remover.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl EventPublisher for TransferEventBus {
    async fn publish(&self, event: TransferEvent) -> Result<(), event::Error> {
        self.broadcast(event).await;
        Ok(())
    }
}

/// A live subscription.
///
/// Wraps the receiving end of the subscriber channel; dropping it notifies
/// the bus so the registration can be removed.
#[derive(Debug)]
pub struct ActiveSubscription {
    key: SubscriptionKey,
    id: usize,
    receiver: mpsc::Receiver<TransferEvent>,
    drop: mpsc::Sender<(SubscriptionKey, usize)>,
}

impl Deref for ActiveSubscription {
    type Target = mpsc::Receiver<TransferEvent>;

    fn deref(&self) -> &Self::Target {
        &self.receiver
    }
}

impl DerefMut for ActiveSubscription {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.receiver
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        let _ = self.drop.try_send((self.key.clone(), self.id));
    }
}
