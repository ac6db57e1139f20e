use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use donation_relay::broadcast::SubscriberSet;
use donation_relay::feed::FeedClient;
use donation_relay::history::HistoryBuffer;
use donation_relay::server::{self, AppState};
use donation_relay::settings::{Logging, Settings};
use donation_relay::{dispatch, ConfigStore, Relay};
use log::{debug, info};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Loading .env file
    dotenv::dotenv().ok();
    // Load settings file
    let settings = Settings::new().await?;

    init_logger(&settings.logging)?;

    info!("Configuring ...");

    let config = ConfigStore::new(settings.relay);
    let (dispatcher, _dispatch_task) = dispatch::spawn(&config);
    let relay = Relay::new(
        config.clone(),
        Arc::new(HistoryBuffer::default()),
        Arc::new(SubscriberSet::new()),
        dispatcher,
    );

    info!("Starting ...");

    debug!("Spawning upstream feed");
    let feed = FeedClient::new(settings.feed, config.clone(), relay.clone());
    let feed_task = tokio::spawn(feed.run());

    server::serve(settings.server.bind, AppState { relay, config }).await?;

    info!("Shutting down");
    feed_task.abort();

    Ok(())
}

/// Set up a combined logger which will log to the terminal and a file, depending on which
/// backends are configured.
fn init_logger(logging: &Logging) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    if let Some(terminal) = &logging.terminal {
        loggers.push(TermLogger::new(
            terminal.filter,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }

    if let Some(file) = &logging.file {
        let log_file = File::create(&file.path)
            .with_context(|| format!("failed creating log file at '{}'", file.path.display()))?;
        loggers.push(WriteLogger::new(file.base.filter, Config::default(), log_file));
    }

    CombinedLogger::init(loggers).context("logger failed to set up")
}
