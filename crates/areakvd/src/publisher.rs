//! Fan-out of accepted changes to live subscribers
//!
//! Each subscriber owns a bounded queue. Delivery never waits: a full queue
//! closes that subscription with [`SubscriptionError::Overflow`] and leaves
//! everyone else untouched.

use crate::filter::CompiledFilter;
use crate::store::UpdateKind;
use areakv_core::{AreaId, KeyVals, NodeId, Publication, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal subscription errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription {0} overflowed its queue and was closed")]
    Overflow(u64),
}

/// An accepted change to deliver
#[derive(Debug, Clone)]
pub struct Delta {
    pub key: String,
    pub value: Value,
    pub kind: UpdateKind,
}

/// Hub-side half of a subscription. Cloned into every subscribed area.
#[derive(Clone)]
pub struct SubscriberHandle {
    id: u64,
    filter: Arc<CompiledFilter>,
    tx: mpsc::Sender<Publication>,
    token: CancellationToken,
    overflowed: Arc<AtomicBool>,
}

impl SubscriberHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &CompiledFilter {
        &self.filter
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer half of a subscription: a live stream of publications
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Publication>,
    token: CancellationToken,
    overflowed: Arc<AtomicBool>,
    finished: bool,
}

/// Create both halves of a subscription
pub fn subscription_channel(
    id: u64,
    filter: CompiledFilter,
    queue_size: usize,
) -> (SubscriberHandle, Subscription) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    let token = CancellationToken::new();
    let overflowed = Arc::new(AtomicBool::new(false));
    let handle = SubscriberHandle {
        id,
        filter: Arc::new(filter),
        tx,
        token: token.clone(),
        overflowed: overflowed.clone(),
    };
    let subscription = Subscription {
        id,
        rx,
        token,
        overflowed,
        finished: false,
    };
    (handle, subscription)
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next publication.
    ///
    /// Returns `None` once the subscription ends normally (cancelled or the
    /// store dropped), and `Some(Err(Overflow))` exactly once if it was closed
    /// for falling behind.
    pub async fn recv(&mut self) -> Option<Result<Publication, SubscriptionError>> {
        if self.finished {
            return None;
        }
        let next = tokio::select! {
            biased;
            publication = self.rx.recv() => publication,
            _ = self.token.cancelled() => self.rx.try_recv().ok(),
        };
        self.settle(next)
    }

    /// Non-waiting variant of [`Subscription::recv`]; `None` also when the
    /// queue is momentarily empty.
    pub fn try_recv(&mut self) -> Option<Result<Publication, SubscriptionError>> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(publication) => Some(Ok(publication)),
            Err(mpsc::error::TryRecvError::Empty) if !self.token.is_cancelled() => None,
            Err(_) => self.settle(None),
        }
    }

    fn settle(
        &mut self,
        next: Option<Publication>,
    ) -> Option<Result<Publication, SubscriptionError>> {
        match next {
            Some(publication) => Some(Ok(publication)),
            None => {
                self.finished = true;
                self.overflowed
                    .load(Ordering::Acquire)
                    .then_some(Err(SubscriptionError::Overflow(self.id)))
            }
        }
    }

    /// Stop the subscription. Already queued publications may still be read.
    ///
    /// Areas release their handle on their next publish or count; use
    /// `KvStore::unsubscribe` to release it right away.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Live subscribers of one area
#[derive(Default)]
pub struct PublisherHub {
    subscribers: Vec<SubscriberHandle>,
}

impl PublisherHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: SubscriberHandle) {
        debug!("Subscriber {} registered", handle.id);
        self.subscribers.push(handle);
    }

    /// Drop the handle for subscription `id`
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Live subscriber count, dropping torn-down ones
    pub fn len(&mut self) -> usize {
        self.subscribers.retain(|s| !s.is_closed());
        self.subscribers.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Deliver a batch of changes and purged keys to every matching
    /// subscriber. Returns the number of publications enqueued.
    pub fn publish(
        &mut self,
        area: &AreaId,
        deltas: &[Delta],
        expired: &[(String, NodeId)],
        timestamp_ms: u64,
    ) -> usize {
        if deltas.is_empty() && expired.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        self.subscribers.retain(|subscriber| {
            if subscriber.is_closed() {
                return false;
            }

            let key_vals: KeyVals = deltas
                .iter()
                .filter_map(|d| {
                    subscriber
                        .filter
                        .delta_value(&d.key, &d.value, d.kind)
                        .map(|v| (d.key.clone(), v))
                })
                .collect();
            let expired_keys: Vec<String> = expired
                .iter()
                .filter(|(key, originator)| subscriber.filter.matches(key, originator))
                .map(|(key, _)| key.clone())
                .collect();

            let publication = Publication {
                area: Some(area.clone()),
                key_vals,
                expired_keys,
                timestamp_ms,
            };
            if publication.is_empty() {
                return true;
            }

            match subscriber.tx.try_send(publication) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} in area {} fell behind, closing subscription",
                        subscriber.id, area
                    );
                    subscriber.overflowed.store(true, Ordering::Release);
                    subscriber.token.cancel();
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }
}
