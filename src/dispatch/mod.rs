//! Mirroring of qualifying donations into external chat platforms.
//!
//! The dispatcher runs on its own task and is fed [`Command`]s through a [`DispatcherHandle`].
//! Every destination drains its own queue on a separate worker task, so a slow or stuck platform
//! only delays itself. Failures never leave the dispatcher; every outcome is only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::{ConfigStore, RelayConfig};
use crate::error::DispatchError;
use crate::models::DonationEvent;

pub mod discord;
pub mod template;
pub mod twitch;
pub mod youtube;

pub use discord::Discord;
pub use twitch::TwitchSession;
pub use youtube::{LiveChatApi, YouTube, YouTubeClient};

/// How long a stopped worker may take to finish its queue before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A chat platform that donation messages can be mirrored to.
#[async_trait]
pub trait Destination: Send {
    /// Short lowercase name used in logs.
    fn name(&self) -> &'static str;

    /// Deliver one already formatted message.
    async fn send(&mut self, text: &str) -> Result<(), DispatchError>;

    /// Tear down any long-lived session. Must not fail.
    async fn shutdown(&mut self) {}
}

/// One destination together with the task delivering its messages in order.
struct Worker {
    name: &'static str,
    queue: mpsc::UnboundedSender<Arc<str>>,
    task: JoinHandle<()>,
}

impl Worker {
    fn spawn(mut destination: Box<dyn Destination>) -> Self {
        let name = destination.name();
        let (queue, mut rx) = mpsc::unbounded_channel::<Arc<str>>();

        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                match destination.send(&text).await {
                    Ok(()) => debug!("Dispatched donation to {}", name),
                    Err(DispatchError::NotReady(reason)) => {
                        warn!("Skipped {} message: {}", name, reason)
                    }
                    Err(e) => error!("{} send error: {}", name, e),
                }
            }
            destination.shutdown().await;
        });

        Self { name, queue, task }
    }

    fn push(&self, text: Arc<str>) {
        if self.queue.send(text).is_err() {
            error!("{} worker is gone, dropping chat message", self.name);
        }
    }

    /// Let the worker finish what is queued, aborting it if that takes too long.
    async fn stop(self) {
        let Self { name, queue, mut task } = self;
        drop(queue);

        if time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("{} did not stop in time, aborting it", name);
            task.abort();
        }
    }
}

/// Set of destination workers built from one configuration.
pub struct Dispatcher {
    template: Option<String>,
    workers: Vec<Worker>,
    /// Written back to when a destination switches itself off.
    store: Option<ConfigStore>,
}

impl Dispatcher {
    /// Build workers for all usable destinations of the store's current configuration.
    pub fn new(store: ConfigStore) -> Self {
        let config = store.get();
        let mut dispatcher = Self {
            template: None,
            workers: Vec::new(),
            store: Some(store),
        };
        dispatcher.build(&config);
        dispatcher
    }

    /// Dispatcher over a fixed set of destinations, detached from any configuration store.
    pub fn with_destinations(
        template: Option<String>,
        destinations: Vec<Box<dyn Destination>>,
    ) -> Self {
        Self {
            template,
            workers: destinations.into_iter().map(Worker::spawn).collect(),
            store: None,
        }
    }

    fn build(&mut self, config: &RelayConfig) {
        let mut destinations: Vec<Box<dyn Destination>> = Vec::new();

        if config.twitch.is_usable() {
            destinations.push(Box::new(TwitchSession::start(&config.twitch)));
        }

        if config.youtube.is_usable() {
            match YouTube::from_config(&config.youtube) {
                Ok(youtube) => {
                    let youtube = match &self.store {
                        Some(store) => youtube.with_store(store.clone()),
                        None => youtube,
                    };
                    destinations.push(Box::new(youtube));
                }
                Err(e) => error!("Failed setting up YouTube client: {}", e),
            }
        }

        if config.discord.is_usable() {
            if let Some(discord) = Discord::from_config(&config.discord) {
                destinations.push(Box::new(discord));
            }
        }

        self.template = config.chat_template.clone();
        self.workers = destinations.into_iter().map(Worker::spawn).collect();
    }

    /// Names of the active destinations.
    pub fn destinations(&self) -> Vec<&'static str> {
        self.workers.iter().map(|w| w.name).collect()
    }

    /// Tear down the current workers in the background and build new ones from `config`.
    pub fn reconfigure(&mut self, config: &RelayConfig) {
        for worker in self.workers.drain(..) {
            tokio::spawn(worker.stop());
        }
        self.build(config);
        info!("Chat destinations configured: {:?}", self.destinations());
    }

    /// Stop every worker, waiting for queued messages up to a grace period.
    pub async fn shutdown(&mut self) {
        for worker in self.workers.drain(..) {
            worker.stop().await;
        }
    }

    /// Format the message for a donation and queue it for every destination. Returns the
    /// rendered text.
    pub fn send(&self, event: &DonationEvent) -> String {
        let text = template::render(self.template.as_deref(), event);
        let shared: Arc<str> = text.as_str().into();

        for worker in &self.workers {
            worker.push(shared.clone());
        }

        text
    }
}

/// Work items of the dispatcher task, handled in the order they were submitted.
#[derive(Debug)]
pub enum Command {
    /// Replace all destinations with ones built from this configuration.
    Reconfigure(Arc<RelayConfig>),
    Send(Arc<DonationEvent>),
}

/// Cheap, cloneable handle used to submit work to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    /// Create a handle together with the receiving end a dispatcher task consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a donation for dispatch without waiting for it.
    pub fn submit(&self, event: Arc<DonationEvent>) {
        if self.tx.send(Command::Send(event)).is_err() {
            error!("Dispatcher task is gone, dropping chat message");
        }
    }

    /// Queue a reconfiguration.
    pub fn reconfigure(&self, config: Arc<RelayConfig>) {
        if self.tx.send(Command::Reconfigure(config)).is_err() {
            error!("Dispatcher task is gone, ignoring configuration update");
        }
    }
}

/// Spawn the dispatcher task. Every change of the configuration store is turned into a
/// [`Command::Reconfigure`]. The task stops once every handle is dropped.
pub fn spawn(store: &ConfigStore) -> (DispatcherHandle, JoinHandle<()>) {
    let (handle, rx) = DispatcherHandle::channel();
    let changes = store.subscribe();
    let task = tokio::spawn(run(store.clone(), rx));
    tokio::spawn(forward_changes(changes, handle.tx.downgrade()));
    (handle, task)
}

async fn forward_changes(
    mut changes: watch::Receiver<Arc<RelayConfig>>,
    tx: mpsc::WeakUnboundedSender<Command>,
) {
    while changes.changed().await.is_ok() {
        let config = changes.borrow_and_update().clone();
        let Some(tx) = tx.upgrade() else { break };
        if tx.send(Command::Reconfigure(config)).is_err() {
            break;
        }
    }
}

async fn run(store: ConfigStore, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut dispatcher = Dispatcher::new(store);
    info!("Chat destinations configured: {:?}", dispatcher.destinations());

    while let Some(command) = commands.recv().await {
        match command {
            Command::Reconfigure(config) => dispatcher.reconfigure(&config),
            Command::Send(event) => {
                dispatcher.send(&event);
            }
        }
    }

    dispatcher.shutdown().await;
    debug!("Dispatcher stopped");
}
