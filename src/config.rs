//! Runtime configuration of the relay and the store that shares it between tasks.
//!
//! The configuration is only ever replaced as a whole. Readers take an [`Arc`] snapshot and never
//! see a half-applied update.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Everything the relay needs to decide what to listen to and where to mirror donations.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upstream user whose donation feed is followed. Nothing is relayed while unset.
    pub target_user_id: Option<String>,
    /// Donations below this amount are not mirrored to chat.
    pub min_amount: u64,
    /// Chat message template with `{amount}`, `{username}` and `{message}` placeholders.
    pub chat_template: Option<String>,
    pub twitch: TwitchConfig,
    pub youtube: YouTubeConfig,
    pub discord: DiscordConfig,
}

/// Twitch chat, driven through a persistent IRC session.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub enabled: bool,
    pub token: String,
    pub channel: String,
    /// Login name of the token owner. Defaults to the channel name.
    pub nick: Option<String>,
}

/// YouTube live chat, driven through the Data API.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct YouTubeConfig {
    pub enabled: bool,
    /// OAuth access token with the `youtube.force-ssl` scope.
    pub token: String,
    /// Live chat to post to. Looked up from the active broadcast when unset.
    pub chat_id: Option<String>,
}

/// Discord channel, posted to with a bot account.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub channel_id: u64,
}

impl TwitchConfig {
    /// Whether the destination is switched on and has everything needed to connect.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.token.is_empty() && !self.channel.is_empty()
    }
}

impl YouTubeConfig {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.token.is_empty()
    }
}

impl DiscordConfig {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.bot_token.is_empty() && self.channel_id != 0
    }
}

impl RelayConfig {
    /// Copy of the configuration with all credentials blanked, suitable for API responses.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        redact(&mut config.twitch.token);
        redact(&mut config.youtube.token);
        redact(&mut config.discord.bot_token);
        config
    }

    /// The target user, treating an empty string as unset.
    pub fn target(&self) -> Option<&str> {
        self.target_user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

fn redact(secret: &mut String) {
    if !secret.is_empty() {
        *secret = "********".to_owned();
    }
}

/// Shared handle to the current [`RelayConfig`]. Cloning the store yields another handle to the
/// same value.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<Arc<RelayConfig>>>,
}

impl ConfigStore {
    pub fn new(config: RelayConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Arc<RelayConfig> {
        self.tx.borrow().clone()
    }

    /// Apply a change to a copy of the current configuration and store the result.
    pub fn update<F>(&self, f: F) -> Arc<RelayConfig>
    where
        F: FnOnce(&mut RelayConfig),
    {
        let mut updated = Arc::default();
        self.tx.send_modify(|current| {
            f(Arc::make_mut(current));
            updated = current.clone();
        });
        updated
    }

    /// Like [`ConfigStore::update`], but nothing is stored and nobody is notified if `f` fails.
    pub fn try_update<F, E>(&self, f: F) -> Result<Arc<RelayConfig>, E>
    where
        F: FnOnce(&mut RelayConfig) -> Result<(), E>,
    {
        let mut outcome = Ok(Arc::default());
        self.tx.send_if_modified(|current| {
            let mut config = (**current).clone();
            match f(&mut config) {
                Ok(()) => {
                    *current = Arc::new(config);
                    outcome = Ok(current.clone());
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Receiver that is notified on every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RelayConfig>> {
        self.tx.subscribe()
    }
}
