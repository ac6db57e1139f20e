//! Client for the upstream donation stream.
//!
//! A single supervising loop follows the configured target user for the whole process lifetime:
//! it idles while no target is set, connects when one appears, reconnects after a backoff when
//! the connection fails and drops the connection right away when the target changes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{ConfigStore, RelayConfig};
use crate::error::FeedError;
use crate::models::{parse_inbound, Inbound};
use crate::relay::Relay;

/// Upstream endpoint, `{id}` is replaced with the target user id.
pub const DEFAULT_URL_TEMPLATE: &str = "wss://stream.plsdonate.com/api/user/{id}/websocket";

/// Timings and endpoint of the feed client.
#[derive(Clone, Debug)]
pub struct FeedOptions {
    pub url_template: String,
    /// How often a keep-alive ping is sent.
    pub ping_interval: Duration,
    /// How long to wait for any traffic after a ping before the connection counts as dead.
    pub ping_timeout: Duration,
    /// Pause between a failed connection and the next attempt.
    pub reconnect_delay: Duration,
    /// How often the configuration is re-checked while no target is set.
    pub idle_poll: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.to_owned(),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            idle_poll: Duration::from_secs(1),
        }
    }
}

impl FeedOptions {
    pub fn url_for(&self, target: &str) -> String {
        self.url_template.replace("{id}", target)
    }
}

/// Why a streaming session ended without an error.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// The target user changed (or was cleared) while connected.
    Retarget,
}

pub struct FeedClient {
    options: FeedOptions,
    // Keeps the sender side of the watch channel alive.
    _store: ConfigStore,
    config: watch::Receiver<Arc<RelayConfig>>,
    relay: Relay,
}

impl FeedClient {
    pub fn new(options: FeedOptions, store: ConfigStore, relay: Relay) -> Self {
        let config = store.subscribe();
        Self {
            options,
            _store: store,
            config,
            relay,
        }
    }

    fn current_target(&self) -> Option<String> {
        self.config.borrow().target().map(str::to_owned)
    }

    fn target_changed(&self, connected: &str) -> bool {
        self.config.borrow().target() != Some(connected)
    }

    /// Follow the configured target forever.
    pub async fn run(mut self) {
        loop {
            let Some(target) = self.current_target() else {
                self.wait_idle().await;
                continue;
            };

            let url = self.options.url_for(&target);
            info!("Connecting to {}...", url);

            match self.stream(&target, &url).await {
                Ok(SessionEnd::Retarget) => {
                    info!("User ID changed, reconnecting...");
                }
                Err(e) => {
                    error!("Connection error: {}", e);
                    time::sleep(self.options.reconnect_delay).await;
                }
            }
        }
    }

    async fn wait_idle(&mut self) {
        tokio::select! {
            _ = time::sleep(self.options.idle_poll) => {}
            _ = self.config.changed() => {}
        }
    }

    async fn stream(&mut self, target: &str, url: &str) -> Result<SessionEnd, FeedError> {
        let (mut ws, _) = connect_async(url).await?;
        info!("Connected to stream for user {}", target);

        let mut ping = time::interval_at(
            Instant::now() + self.options.ping_interval,
            self.options.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;

            tokio::select! {
                _ = ping.tick() => {
                    if pong_deadline.is_none() {
                        trace!("Sending keep-alive ping");
                        ws.send(Message::Ping(Default::default())).await?;
                        pong_deadline = Some(Instant::now() + self.options.ping_timeout);
                    }
                }

                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Err(FeedError::KeepaliveTimeout(self.options.ping_timeout));
                }

                Ok(()) = self.config.changed() => {
                    if self.target_changed(target) {
                        ws.close(None).await.ok();
                        return Ok(SessionEnd::Retarget);
                    }
                }

                msg = ws.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(FeedError::Closed),
                    };
                    pong_deadline = None;

                    // Anything arriving after a retarget belongs to the old user.
                    if self.target_changed(target) {
                        ws.close(None).await.ok();
                        return Ok(SessionEnd::Retarget);
                    }

                    match msg {
                        Message::Text(text) => {
                            self.process(&text);
                        }
                        Message::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => {
                                self.process(text);
                            }
                            Err(_) => warn!("Received non-UTF-8 binary message, ignoring"),
                        },
                        Message::Close(frame) => {
                            debug!("Upstream closed the connection: {:?}", frame);
                            return Err(FeedError::Closed);
                        }
                        _ => trace!("Keep-alive frame from upstream"),
                    }
                }
            }
        }
    }

    /// Handle one upstream text message. Returns whether it was a donation.
    pub fn process(&self, text: &str) -> bool {
        match parse_inbound(text) {
            Ok(Inbound::Donation(event)) => {
                self.relay.handle(event);
                true
            }
            Ok(Inbound::KeepAlive) => {
                trace!("Keep-alive message from upstream");
                false
            }
            Ok(Inbound::Other) => {
                debug!("Ignoring non-donation message");
                false
            }
            Err(e) => {
                error!("Received non-JSON message: {} ({})", text, e);
                false
            }
        }
    }
}
