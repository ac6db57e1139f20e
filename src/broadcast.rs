//! Registry of connected local subscribers (dashboard, overlays) and the fan-out to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::models::DonationEvent;

pub type SubscriberId = u64;

/// Events a subscriber may have pending before it counts as stalled and is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Receiving side of a subscriber handle, owned by the subscriber's connection task. Each item
/// is one JSON encoded [`DonationEvent`].
pub type SubscriberFeed = Receiver<Arc<str>>;

/// Set of live subscriber handles.
///
/// Removal goes through [`SubscriberSet::unregister`] only, which is idempotent. The connection
/// task calls it when its socket closes and [`SubscriberSet::broadcast`] calls it for handles
/// whose receiving side is gone or whose queue is full.
pub struct SubscriberSet {
    next_id: AtomicU64,
    queue: usize,
    subscribers: Mutex<HashMap<SubscriberId, Sender<Arc<str>>>>,
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::with_queue(SUBSCRIBER_QUEUE)
    }
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whose subscribers may each have up to `queue` undelivered events.
    pub fn with_queue(queue: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            queue: queue.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Add a new subscriber and return its id together with the stream of events for it.
    pub fn register(&self) -> (SubscriberId, SubscriberFeed) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue);
        self.subscribers.lock().insert(id, tx);
        debug!("Subscriber {} registered", id);
        (id, rx)
    }

    /// Remove a subscriber. Does nothing if it's already gone.
    pub fn unregister(&self, id: SubscriberId) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!("Subscriber {} unregistered", id);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every subscriber and return how many received it. Subscribers that
    /// are gone or too far behind are dropped from the set once the pass completes.
    pub fn broadcast(&self, event: &DonationEvent) -> usize {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed serializing donation event: {}", e);
                return 0;
            }
        };

        let targets: Vec<_> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", id);
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => failed.push(id),
            }
        }

        for id in failed {
            self.unregister(id);
        }

        delivered
    }
}
