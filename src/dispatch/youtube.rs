//! YouTube live chat destination.
//!
//! Each call is a plain Data API request. The live chat id is resolved on first use and cached
//! until a request fails. The API's daily quota is small, so running out of it (or having the
//! access token expire) switches the destination off and clears `youtube.enabled` in the shared
//! configuration, so it stays off until a settings update enables it again.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::Destination;
use crate::config::{ConfigStore, YouTubeConfig};
use crate::error::DispatchError;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The calls the destination makes against YouTube.
#[async_trait]
pub trait LiveChatApi: Send + Sync {
    /// Live chat id of the channel's currently active broadcast.
    async fn active_live_chat_id(&self) -> Result<String, DispatchError>;

    /// Post a text message into the given live chat.
    async fn insert_message(&self, live_chat_id: &str, text: &str) -> Result<(), DispatchError>;
}

/// [`LiveChatApi`] backed by the YouTube Data API v3.
pub struct YouTubeClient {
    http: reqwest::Client,
    token: String,
}

#[derive(Deserialize)]
struct BroadcastList {
    #[serde(default)]
    items: Vec<Broadcast>,
}

#[derive(Deserialize)]
struct Broadcast {
    snippet: BroadcastSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastSnippet {
    live_chat_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

impl YouTubeClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            token: token.into(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

#[async_trait]
impl LiveChatApi for YouTubeClient {
    async fn active_live_chat_id(&self) -> Result<String, DispatchError> {
        let response = self
            .http
            .get(format!("{}/liveBroadcasts", API_BASE))
            .query(&[
                ("part", "snippet"),
                ("broadcastStatus", "active"),
                ("broadcastType", "all"),
            ])
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await?;

        let list = Self::check(response).await?.json::<BroadcastList>().await?;

        list.items
            .into_iter()
            .find_map(|b| b.snippet.live_chat_id)
            .ok_or_else(|| DispatchError::NotReady("no active YouTube broadcast".to_owned()))
    }

    async fn insert_message(&self, live_chat_id: &str, text: &str) -> Result<(), DispatchError> {
        let response = self
            .http
            .post(format!("{}/liveChat/messages", API_BASE))
            .query(&[("part", "snippet")])
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&json!({
                "snippet": {
                    "liveChatId": live_chat_id,
                    "type": "textMessageEvent",
                    "textMessageDetails": { "messageText": text },
                }
            }))
            .send()
            .await?;

        Self::check(response).await.map(drop)
    }
}

/// Map an unsuccessful API response to the matching error kind.
fn classify(status: StatusCode, body: &str) -> DispatchError {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    let message = parsed
        .as_ref()
        .map(|r| r.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.to_string());
    let quota = parsed
        .as_ref()
        .map(|r| r.error.errors.iter().any(|e| e.reason == "quotaExceeded"))
        .unwrap_or_else(|| body.contains("quotaExceeded"));

    match status {
        StatusCode::FORBIDDEN if quota => DispatchError::QuotaExceeded(message),
        StatusCode::UNAUTHORIZED => DispatchError::Auth(message),
        _ => DispatchError::Transient(format!("{}: {}", status, message)),
    }
}

/// YouTube destination state for one configuration.
pub struct YouTube<A = YouTubeClient> {
    api: A,
    configured_chat_id: Option<String>,
    cached_chat_id: Option<String>,
    disabled: bool,
    store: Option<ConfigStore>,
}

impl YouTube<YouTubeClient> {
    pub fn from_config(config: &YouTubeConfig) -> Result<Self, DispatchError> {
        let api = YouTubeClient::new(config.token.trim())?;
        Ok(Self::new(api, config.chat_id.clone()))
    }
}

impl<A: LiveChatApi> YouTube<A> {
    pub fn new(api: A, chat_id: Option<String>) -> Self {
        Self {
            api,
            configured_chat_id: chat_id.filter(|id| !id.trim().is_empty()),
            cached_chat_id: None,
            disabled: false,
            store: None,
        }
    }

    /// Record a self-disable in `store` as well.
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Currently cached live chat id.
    pub fn cached_chat_id(&self) -> Option<&str> {
        self.cached_chat_id.as_deref()
    }

    /// Whether the destination switched itself off for this session.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    async fn resolve_chat_id(&mut self) -> Result<String, DispatchError> {
        if let Some(id) = &self.cached_chat_id {
            return Ok(id.clone());
        }

        let id = match &self.configured_chat_id {
            Some(id) => id.clone(),
            None => self.api.active_live_chat_id().await?,
        };

        debug!("Resolved YouTube live chat {}", id);
        self.cached_chat_id = Some(id.clone());
        Ok(id)
    }

    async fn try_send(&mut self, text: &str) -> Result<(), DispatchError> {
        let chat_id = self.resolve_chat_id().await?;
        self.api.insert_message(&chat_id, text).await
    }

    fn on_failure(&mut self, error: &DispatchError) {
        self.cached_chat_id = None;

        match error {
            DispatchError::QuotaExceeded(_) => {
                warn!("YouTube daily quota exceeded, disabling YouTube");
            }
            DispatchError::Auth(_) => {
                warn!("YouTube access token rejected, disabling YouTube until it is replaced");
            }
            _ => return,
        }

        self.disabled = true;
        if let Some(store) = &self.store {
            store.update(|c| c.youtube.enabled = false);
        }
    }
}

#[async_trait]
impl<A: LiveChatApi> Destination for YouTube<A> {
    fn name(&self) -> &'static str {
        "youtube"
    }

    async fn send(&mut self, text: &str) -> Result<(), DispatchError> {
        if self.disabled {
            debug!("YouTube disabled, skipping message");
            return Ok(());
        }

        match self.try_send(text).await {
            Ok(()) => {
                info!("Sent YouTube message");
                Ok(())
            }
            Err(e) => {
                self.on_failure(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::RelayConfig;
    use crate::dispatch::Dispatcher;

    /// Scripted API that pops one prepared outcome per call and records what it was asked.
    #[derive(Clone, Default)]
    struct FakeApi {
        lookups: Arc<Mutex<VecDeque<Result<String, DispatchError>>>>,
        inserts: Arc<Mutex<VecDeque<Result<(), DispatchError>>>>,
        lookup_calls: Arc<Mutex<usize>>,
        sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl FakeApi {
        fn lookup(self, result: Result<String, DispatchError>) -> Self {
            self.lookups.lock().push_back(result);
            self
        }

        fn insert(self, result: Result<(), DispatchError>) -> Self {
            self.inserts.lock().push_back(result);
            self
        }
    }

    #[async_trait]
    impl LiveChatApi for FakeApi {
        async fn active_live_chat_id(&self) -> Result<String, DispatchError> {
            *self.lookup_calls.lock() += 1;
            self.lookups
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("chat-default".to_owned()))
        }

        async fn insert_message(&self, live_chat_id: &str, text: &str) -> Result<(), DispatchError> {
            self.sent
                .lock()
                .push((live_chat_id.to_owned(), text.to_owned()));
            self.inserts.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    #[tokio::test]
    async fn caches_resolved_chat_id() {
        let api = FakeApi::default().lookup(Ok("chat-1".into()));
        let mut youtube = YouTube::new(api.clone(), None);

        youtube.send("a").await.unwrap();
        youtube.send("b").await.unwrap();

        assert_eq!(*api.lookup_calls.lock(), 1);
        assert_eq!(youtube.cached_chat_id(), Some("chat-1"));
        assert_eq!(api.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn transient_failure_clears_cache_only() {
        let api = FakeApi::default()
            .lookup(Ok("chat-1".into()))
            .lookup(Ok("chat-2".into()))
            .insert(Err(DispatchError::Transient("503".into())));
        let mut youtube = YouTube::new(api.clone(), None);

        assert!(youtube.send("a").await.is_err());
        assert_eq!(youtube.cached_chat_id(), None);
        assert!(!youtube.is_disabled());

        youtube.send("b").await.unwrap();
        assert_eq!(*api.lookup_calls.lock(), 2);
        assert_eq!(youtube.cached_chat_id(), Some("chat-2"));
        assert_eq!(api.sent.lock()[1], ("chat-2".to_owned(), "b".to_owned()));
    }

    #[tokio::test]
    async fn failed_lookup_is_retried() {
        let api = FakeApi::default()
            .lookup(Err(DispatchError::Transient("timeout".into())))
            .lookup(Ok("chat-1".into()));
        let mut youtube = YouTube::new(api.clone(), None);

        assert!(youtube.send("a").await.is_err());
        youtube.send("b").await.unwrap();

        assert_eq!(*api.lookup_calls.lock(), 2);
        assert_eq!(api.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn quota_exceeded_disables_destination() {
        let api = FakeApi::default().insert(Err(DispatchError::QuotaExceeded("quota".into())));
        let mut youtube = YouTube::new(api.clone(), Some("chat-x".into()));

        assert!(matches!(
            youtube.send("a").await,
            Err(DispatchError::QuotaExceeded(_))
        ));
        assert!(youtube.is_disabled());

        youtube.send("b").await.unwrap();
        youtube.send("c").await.unwrap();
        assert_eq!(api.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn configured_chat_id_skips_lookup() {
        let api = FakeApi::default();
        let mut youtube = YouTube::new(api.clone(), Some("chat-x".into()));

        youtube.send("a").await.unwrap();

        assert_eq!(*api.lookup_calls.lock(), 0);
        assert_eq!(api.sent.lock()[0].0, "chat-x");
    }

    #[tokio::test]
    async fn disable_survives_unrelated_updates() {
        let mut config = RelayConfig::default();
        config.youtube.enabled = true;
        config.youtube.token = "token".into();
        let store = ConfigStore::new(config);

        let api = FakeApi::default().insert(Err(DispatchError::QuotaExceeded("quota".into())));
        let mut youtube = YouTube::new(api, Some("chat-x".into())).with_store(store.clone());
        assert!(youtube.send("a").await.is_err());
        assert!(!store.get().youtube.enabled);

        store.update(|c| c.min_amount = 5);
        assert!(Dispatcher::new(store.clone()).destinations().is_empty());

        store.update(|c| c.youtube.enabled = true);
        assert_eq!(Dispatcher::new(store.clone()).destinations(), vec!["youtube"]);
    }

    #[tokio::test]
    async fn auth_failure_disables_destination() {
        let mut config = RelayConfig::default();
        config.youtube.enabled = true;
        let store = ConfigStore::new(config);

        let api = FakeApi::default().lookup(Err(DispatchError::Auth("401".into())));
        let mut youtube = YouTube::new(api.clone(), None).with_store(store.clone());

        assert!(matches!(youtube.send("a").await, Err(DispatchError::Auth(_))));
        youtube.send("b").await.unwrap();

        assert!(youtube.is_disabled());
        assert!(!store.get().youtube.enabled);
        assert_eq!(*api.lookup_calls.lock(), 1);
    }

    #[test]
    fn classifies_api_errors() {
        let quota = r#"{"error":{"code":403,"message":"The request cannot be completed because you have exceeded your quota.","errors":[{"reason":"quotaExceeded"}]}}"#;
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, quota),
            DispatchError::QuotaExceeded(_)
        ));

        let forbidden = r#"{"error":{"code":403,"message":"Forbidden","errors":[{"reason":"liveChatDisabled"}]}}"#;
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, forbidden),
            DispatchError::Transient(_)
        ));

        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, "{}"),
            DispatchError::Auth(_)
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, "quotaExceeded"),
            DispatchError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, ""),
            DispatchError::Transient(_)
        ));
    }
}
