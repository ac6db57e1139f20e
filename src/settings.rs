//! Startup settings of the relay: logging, the local server, the upstream feed and the initial
//! relay configuration.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use simplelog::LevelFilter;
use tokio::fs;

use crate::config::RelayConfig;
use crate::feed::{FeedOptions, DEFAULT_URL_TEMPLATE};

/// Main structure that holds all the settings of the relay.
pub struct Settings {
    /// Logger specific configuration.
    pub logging: Logging,
    /// Where the dashboard server listens.
    pub server: Server,
    /// Upstream connection settings.
    pub feed: FeedOptions,
    /// Initial runtime configuration, replaced later through the settings endpoint.
    pub relay: RelayConfig,
}

/// All configuration for the logging of the relay, including different logging backends like a
/// file or the terminal.
#[derive(Deserialize)]
pub struct Logging {
    /// Logging settings for the terminal backend.
    pub terminal: Option<BaseLogger>,
    /// File backend settings.
    pub file: Option<FileLogger>,
}

/// The base logger describes the very basic settings that apply to each logging backend.
#[derive(Deserialize)]
pub struct BaseLogger {
    /// Maximum logging level that the backend outputs.
    #[serde(with = "SerdeLevelFilter")]
    pub filter: LevelFilter,
}

/// Logging configuration specific to file backends.
#[derive(Deserialize)]
pub struct FileLogger {
    /// base logging backend configuration.
    #[serde(flatten)]
    pub base: BaseLogger,
    /// Location of the file to write logs to.
    pub path: PathBuf,
}

/// Settings of the local HTTP server.
#[derive(Deserialize)]
pub struct Server {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 5000).into()
}

/// Upstream feed settings as written in the config file.
#[derive(Deserialize)]
#[serde(default)]
struct Feed {
    url_template: String,
    #[serde(deserialize_with = "crate::de::duration")]
    ping_interval: Duration,
    #[serde(deserialize_with = "crate::de::duration")]
    ping_timeout: Duration,
    #[serde(deserialize_with = "crate::de::duration")]
    reconnect_delay: Duration,
    #[serde(deserialize_with = "crate::de::duration")]
    idle_poll: Duration,
}

impl Default for Feed {
    fn default() -> Self {
        let FeedOptions {
            url_template,
            ping_interval,
            ping_timeout,
            reconnect_delay,
            idle_poll,
        } = FeedOptions::default();

        Self {
            url_template,
            ping_interval,
            ping_timeout,
            reconnect_delay,
            idle_poll,
        }
    }
}

impl From<Feed> for FeedOptions {
    fn from(feed: Feed) -> Self {
        let url_template = if feed.url_template.contains("{id}") {
            feed.url_template
        } else {
            log::warn!(
                "Feed URL template '{}' lacks an {{id}} placeholder, using the default",
                feed.url_template
            );
            DEFAULT_URL_TEMPLATE.to_owned()
        };

        Self {
            url_template,
            ping_interval: feed.ping_interval,
            ping_timeout: feed.ping_timeout,
            reconnect_delay: feed.reconnect_delay,
            idle_poll: feed.idle_poll,
        }
    }
}

/// A wrapper for the [LevelFilter] that allows to use it in [serde], as it doesn't provide support
/// for it out of the box.
#[derive(Deserialize)]
#[serde(remote = "LevelFilter", rename_all = "lowercase")]
enum SerdeLevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// An intermediate structure for the relay file that allows to parse it separately and merge it
/// with the logging settings into a single [Settings] structure later.
#[derive(Default, Deserialize)]
#[serde(default)]
struct RelayFile {
    server: Server,
    feed: Feed,
    relay: RelayConfig,
}

impl Settings {
    /// Create a new instance of the settings and fill it with the configuration from the
    /// `config/log.toml` and `config/relay.toml` files. The upstream user and all chat
    /// credentials are overwritten by env vars if they exist.
    pub async fn new() -> Result<Self> {
        let logging = load_toml("config/log.toml").await?;
        let RelayFile {
            server,
            feed,
            mut relay,
        } = load_toml("config/relay.toml").await?;

        apply_env(&mut relay, |key| env::var(key).ok());

        Ok(Self {
            logging,
            server,
            feed: feed.into(),
            relay,
        })
    }
}

/// Overwrite values of the relay configuration with those found through `lookup`.
fn apply_env<F>(relay: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(user_id) = lookup("PLSDONATE_USER_ID") {
        relay.target_user_id = Some(user_id);
    }

    if let Some(token) = lookup("TWITCH_TOKEN") {
        relay.twitch.token = token;
    }

    if let Some(token) = lookup("YOUTUBE_TOKEN") {
        relay.youtube.token = token;
    }

    if let Some(token) = lookup("DISCORD_BOT_TOKEN") {
        relay.discord.bot_token = token;
    }
}

/// Load any deserializable structure from the given file path as TOML and provide helpful error
/// messages in case something goes wrong during the process.
async fn load_toml<T>(path: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read(path)
        .await
        .with_context(|| format!("failed loading config file at '{}'", path))?;

    toml::from_slice(&content)
        .with_context(|| format!("failed to parse TOML config from '{}'", path))
}
