//! Local HTTP surface: the subscriber WebSocket used by the dashboard and overlays, the history
//! snapshot and the settings update.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use log::{error, info};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::broadcast::SubscriberSet;
use crate::config::{ConfigStore, DiscordConfig, RelayConfig, TwitchConfig, YouTubeConfig};
use crate::models::DonationEvent;
use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: ConfigStore,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/history", get(history))
        .route("/api/settings", post(update_settings))
        .with_state(state)
}

/// Bind the local address and serve until Ctrl+C is pressed.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed binding local server to {}", addr))?;

    info!("Serving dashboard on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed setting up CTRL+C listener: {}", e);
            }
        })
        .await
        .context("local server failed")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let subscribers = state.relay.subscribers().clone();
    ws.on_upgrade(move |socket| run_subscriber(socket, subscribers))
}

/// Lifetime of one subscriber connection. Inbound messages are drained and ignored.
async fn run_subscriber(socket: WebSocket, subscribers: Arc<SubscriberSet>) {
    let (id, mut feed) = subscribers.register();
    info!("Subscriber {} connected", id);

    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            payload = feed.recv() => {
                let Some(payload) = payload else { break };
                if tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    subscribers.unregister(id);
    info!("Subscriber {} disconnected", id);
}

async fn history(State(state): State<AppState>) -> Json<Vec<DonationEvent>> {
    let events = state.relay.history().snapshot();
    Json(events.iter().map(|e| e.as_ref().clone()).collect())
}

/// Fields accepted by the settings endpoint. Missing fields keep their current value.
#[derive(Debug, Default, Deserialize)]
struct SettingsUpdate {
    /// `Some(Value::Null)` if the field was sent as `null`.
    #[serde(default, deserialize_with = "present")]
    user_id: Option<Value>,
    min_amount: Option<Value>,
    chat_template: Option<String>,
    twitch: Option<TwitchConfig>,
    youtube: Option<YouTubeConfig>,
    discord: Option<DiscordConfig>,
}

/// Keeps an explicit `null` apart from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

struct BadRequest(String);

impl IntoResponse for BadRequest {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": self.0 })),
        )
            .into_response()
    }
}

impl SettingsUpdate {
    fn apply(self, config: &mut RelayConfig) -> Result<(), BadRequest> {
        if let Some(user_id) = self.user_id {
            config.target_user_id = match user_id {
                Value::Null => None,
                Value::String(s) if s.trim().is_empty() => None,
                Value::String(s) => Some(s.trim().to_owned()),
                Value::Number(n) => Some(n.to_string()),
                other => return Err(BadRequest(format!("invalid user_id: {}", other))),
            };
        }

        if let Some(min_amount) = self.min_amount {
            config.min_amount = parse_min_amount(&min_amount)
                .ok_or_else(|| BadRequest(format!("invalid min_amount: {}", min_amount)))?;
        }

        if let Some(template) = self.chat_template {
            config.chat_template = Some(template).filter(|t| !t.is_empty());
        }
        if let Some(twitch) = self.twitch {
            config.twitch = twitch;
        }
        if let Some(youtube) = self.youtube {
            config.youtube = youtube;
        }
        if let Some(discord) = self.discord {
            config.discord = discord;
        }

        Ok(())
    }
}

fn parse_min_amount(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn update_settings(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, BadRequest> {
    let update: SettingsUpdate =
        serde_json::from_slice(&body).map_err(|e| BadRequest(e.to_string()))?;

    let config = state.config.try_update(|config| update.apply(config))?;

    info!("Settings updated");
    Ok(Json(json!({ "status": "ok", "config": config.redacted() })))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::DispatcherHandle;
    use crate::history::HistoryBuffer;

    fn state() -> AppState {
        let config = ConfigStore::new(RelayConfig::default());
        let (handle, _rx) = DispatcherHandle::channel();
        let relay = Relay::new(
            config.clone(),
            Arc::new(HistoryBuffer::default()),
            Arc::new(SubscriberSet::new()),
            handle,
        );
        AppState { relay, config }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_settings(body: Value) -> Request<Body> {
        Request::post("/api/settings")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn history_returns_events_oldest_first() {
        let state = state();
        for amount in [5, 6] {
            state.relay.handle(
                DonationEvent::from_payload(json!({"sender": {}, "amount": amount})).unwrap(),
            );
        }

        let response = router(state)
            .oneshot(Request::get("/api/history").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["amount"], 5);
        assert_eq!(body[1]["amount"], 6);
        assert_eq!(body[0]["type"], "donation");
    }

    #[tokio::test]
    async fn settings_replace_config() {
        let state = state();
        let store = state.config.clone();

        let response = router(state)
            .oneshot(post_settings(json!({
                "user_id": 12345,
                "min_amount": "10",
                "chat_template": "Thanks {username}",
                "youtube": {"enabled": true, "token": "secret"},
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["config"]["youtube"]["token"], "********");

        let config = store.get();
        assert_eq!(config.target(), Some("12345"));
        assert_eq!(config.min_amount, 10);
        assert_eq!(config.chat_template.as_deref(), Some("Thanks {username}"));
        assert_eq!(config.youtube.token, "secret");
    }

    #[tokio::test]
    async fn settings_keep_missing_fields() {
        let state = state();
        let store = state.config.clone();
        store.update(|c| {
            c.target_user_id = Some("1".into());
            c.min_amount = 3;
        });

        let response = router(state)
            .oneshot(post_settings(json!({ "min_amount": 7 })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get().target(), Some("1"));
        assert_eq!(store.get().min_amount, 7);
    }

    #[tokio::test]
    async fn null_user_id_clears_target() {
        let state = state();
        let store = state.config.clone();
        store.update(|c| c.target_user_id = Some("1".into()));

        let response = router(state)
            .oneshot(post_settings(json!({ "user_id": null })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get().target(), None);
    }

    #[tokio::test]
    async fn unparsable_body_gets_json_error() {
        let state = state();
        let store = state.config.clone();

        let response = router(state.clone())
            .oneshot(
                Request::post("/api/settings")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "error");

        let response = router(state)
            .oneshot(
                Request::post("/api/settings")
                    .body(Body::from(r#"{"min_amount": 8}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get().min_amount, 8);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let state = state();
        let store = state.config.clone();

        let response = router(state)
            .oneshot(post_settings(json!({ "min_amount": "lots" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "error");
        assert_eq!(store.get().min_amount, 0);
    }
}
