use std::sync::Arc;

use log::{debug, info};

use crate::broadcast::SubscriberSet;
use crate::config::ConfigStore;
use crate::dispatch::DispatcherHandle;
use crate::history::HistoryBuffer;
use crate::models::DonationEvent;

/// Routes every parsed donation to the history, the local subscribers and, if it is large
/// enough, the chat dispatcher.
#[derive(Clone)]
pub struct Relay {
    config: ConfigStore,
    history: Arc<HistoryBuffer>,
    subscribers: Arc<SubscriberSet>,
    dispatcher: DispatcherHandle,
}

impl Relay {
    pub fn new(
        config: ConfigStore,
        history: Arc<HistoryBuffer>,
        subscribers: Arc<SubscriberSet>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            config,
            history,
            subscribers,
            dispatcher,
        }
    }

    pub fn history(&self) -> &Arc<HistoryBuffer> {
        &self.history
    }

    pub fn subscribers(&self) -> &Arc<SubscriberSet> {
        &self.subscribers
    }

    /// Record and broadcast the donation unconditionally, then queue it for chat if it clears
    /// the configured minimum. Returns whether it was queued for chat.
    pub fn handle(&self, event: DonationEvent) -> bool {
        info!("Donation: {} - {}", event.sender_name, event.amount);

        let event = Arc::new(event);
        self.history.append(event.clone());
        let delivered = self.subscribers.broadcast(&event);
        debug!("Donation delivered to {} subscribers", delivered);

        let min_amount = self.config.get().min_amount;
        if event.qualifies(min_amount) {
            self.dispatcher.submit(event);
            true
        } else {
            debug!("Donation below minimum of {}, not sent to chat", min_amount);
            false
        }
    }
}
