//! Relay of live donation events from the PLS DONATE stream to local dashboard/overlay
//! subscribers, with optional mirroring of larger donations into Twitch, YouTube and Discord chat.

pub mod broadcast;
pub mod config;
mod de;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod history;
pub mod models;
pub mod relay;
pub mod server;
pub mod settings;

pub use config::{ConfigStore, RelayConfig};
pub use models::DonationEvent;
pub use relay::Relay;
