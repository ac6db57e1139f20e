use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::DonationEvent;

/// Number of donations kept for the dashboard.
pub const HISTORY_CAPACITY: usize = 100;

/// Bounded, oldest-first log of the most recent donations of this session.
pub struct HistoryBuffer {
    capacity: usize,
    events: Mutex<VecDeque<Arc<DonationEvent>>>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Add an event at the end, evicting the oldest ones beyond the capacity. Eviction happens
    /// under the same lock, so the buffer is never observed above capacity.
    pub fn append(&self, event: Arc<DonationEvent>) {
        let mut events = self.events.lock();
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Copy of all stored events, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<DonationEvent>> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
