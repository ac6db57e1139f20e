use async_trait::async_trait;
use log::{debug, info, warn};
use twilight_http::Client as HttpClient;
use twilight_model::id::marker::ChannelMarker;
use twilight_model::id::Id;

use super::Destination;
use crate::config::DiscordConfig;
use crate::error::DispatchError;

/// Discord limits message content to this many characters.
const MAX_CONTENT_CHARS: usize = 2000;

/// Posts donation messages into a Discord channel through the bot HTTP API.
pub struct Discord {
    http: HttpClient,
    channel_id: Id<ChannelMarker>,
}

impl Discord {
    /// Create the destination, or `None` if the configured channel id is invalid.
    pub fn from_config(config: &DiscordConfig) -> Option<Self> {
        let Some(channel_id) = Id::new_checked(config.channel_id) else {
            warn!("Invalid Discord channel id {}", config.channel_id);
            return None;
        };

        debug!("Setting up http client for twilight");
        Some(Self {
            http: HttpClient::new(config.bot_token.trim().to_owned()),
            channel_id,
        })
    }
}

#[async_trait]
impl Destination for Discord {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&mut self, text: &str) -> Result<(), DispatchError> {
        let content: String = text.chars().take(MAX_CONTENT_CHARS).collect();

        debug!("sending discord message to {}", self.channel_id);
        self.http
            .create_message(self.channel_id)
            .content(&content)
            .map_err(|e| DispatchError::Transient(e.to_string()))?
            .exec()
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))?;

        info!("Sent Discord message to {}", self.channel_id);
        Ok(())
    }
}
