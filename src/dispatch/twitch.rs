//! Twitch chat destination.
//!
//! Keeps one authenticated IRC session over WebSocket alive in a background task. The target
//! channel counts as cached once the server acknowledged our `JOIN`, and messages are only
//! accepted while it is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::Destination;
use crate::config::TwitchConfig;
use crate::error::DispatchError;

pub const TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// Delay between reconnect attempts of the IRC session.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Twitch rejects messages longer than this many characters.
const MAX_MESSAGE_CHARS: usize = 500;

/// Credentials and target of an IRC session.
#[derive(Clone, Debug, PartialEq)]
struct Login {
    token: String,
    nick: String,
    channel: String,
}

impl Login {
    fn from_config(config: &TwitchConfig) -> Self {
        let token = config.token.trim();
        let token = token.strip_prefix("oauth:").unwrap_or(token).to_owned();
        let channel = config
            .channel
            .trim()
            .trim_start_matches('#')
            .to_lowercase();
        let nick = config
            .nick
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| channel.clone());

        Self {
            token,
            nick,
            channel,
        }
    }

    fn handshake(&self) -> [String; 3] {
        [
            format!("PASS oauth:{}", self.token),
            format!("NICK {}", self.nick),
            format!("JOIN #{}", self.channel),
        ]
    }
}

/// A single line received from the IRC server, reduced to what the session cares about.
#[derive(Debug, PartialEq)]
enum IrcLine<'a> {
    Ping(&'a str),
    Joined(&'a str),
    AuthFailed,
    Other,
}

fn parse_line(line: &str) -> IrcLine<'_> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);

    // Tags are irrelevant here.
    let line = match line.strip_prefix('@') {
        Some(tagged) => tagged.split_once(' ').map_or("", |(_, rest)| rest),
        None => line,
    };

    if let Some(payload) = line.strip_prefix("PING") {
        return IrcLine::Ping(payload.trim_start());
    }

    let mut parts = line.splitn(4, ' ');
    let _prefix = parts.next();
    match (parts.next(), parts.next()) {
        (Some("JOIN"), Some(channel)) => IrcLine::Joined(channel.trim_start_matches('#')),
        (Some("NOTICE"), Some(_)) if line.contains("Login authentication failed") => {
            IrcLine::AuthFailed
        }
        _ => IrcLine::Other,
    }
}

/// Persistent Twitch chat session for one configuration.
pub struct TwitchSession {
    channel: String,
    joined: Arc<AtomicBool>,
    outbound: UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl TwitchSession {
    /// Start the session against Twitch in the background. Connection problems are retried
    /// inside the task.
    pub fn start(config: &TwitchConfig) -> Self {
        Self::start_at(TWITCH_IRC_URL, config)
    }

    /// Start the session against the IRC-over-WebSocket server at `url`.
    pub fn start_at(url: impl Into<String>, config: &TwitchConfig) -> Self {
        let url = url.into();
        let login = Login::from_config(config);
        let joined = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        info!("Starting Twitch session for #{}", login.channel);

        Self {
            channel: login.channel.clone(),
            joined: joined.clone(),
            outbound,
            task: tokio::spawn(run(url, login, joined, outbound_rx)),
        }
    }
}

#[async_trait]
impl Destination for TwitchSession {
    fn name(&self) -> &'static str {
        "twitch"
    }

    async fn send(&mut self, text: &str) -> Result<(), DispatchError> {
        if !self.joined.load(Ordering::Acquire) {
            return Err(DispatchError::NotReady(format!(
                "Twitch channel #{} not joined yet",
                self.channel
            )));
        }

        self.outbound
            .send(format!("PRIVMSG #{} :{}", self.channel, sanitize(text)))
            .map_err(|_| DispatchError::Transient("Twitch session stopped".to_owned()))
    }

    async fn shutdown(&mut self) {
        debug!("Stopping Twitch session for #{}", self.channel);
        self.task.abort();
        self.joined.store(false, Ordering::Release);
    }
}

impl Drop for TwitchSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// IRC messages are single lines with limited length.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .take(MAX_MESSAGE_CHARS)
        .collect()
}

async fn run(
    url: String,
    login: Login,
    joined: Arc<AtomicBool>,
    mut outbound: UnboundedReceiver<String>,
) {
    loop {
        match session(&url, &login, &joined, &mut outbound).await {
            Ok(()) => {
                debug!("Twitch session for #{} closed", login.channel);
                return;
            }
            Err(e) => warn!("Twitch session for #{} failed: {}", login.channel, e),
        }

        joined.store(false, Ordering::Release);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Drive one IRC connection. Returns `Ok` once the owning [`TwitchSession`] is gone.
async fn session(
    url: &str,
    login: &Login,
    joined: &AtomicBool,
    outbound: &mut UnboundedReceiver<String>,
) -> Result<(), DispatchError> {
    let (mut ws, _) = connect_async(url)
        .await
        .map_err(|e| DispatchError::Transient(e.to_string()))?;

    for line in login.handshake() {
        ws.send(Message::Text(line.into()))
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))?;
    }

    loop {
        tokio::select! {
            line = outbound.recv() => {
                let Some(line) = line else {
                    ws.close(None).await.ok();
                    return Ok(());
                };
                ws.send(Message::Text(line.into()))
                    .await
                    .map_err(|e| DispatchError::Transient(e.to_string()))?;
            }
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(DispatchError::Transient("connection closed".to_owned()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(DispatchError::Transient(e.to_string())),
                };

                for line in text.lines() {
                    match parse_line(line) {
                        IrcLine::Ping(payload) => {
                            ws.send(Message::Text(format!("PONG {}", payload).into()))
                                .await
                                .map_err(|e| DispatchError::Transient(e.to_string()))?;
                        }
                        IrcLine::Joined(channel) if channel == login.channel => {
                            info!("Twitch session joined #{}", channel);
                            joined.store(true, Ordering::Release);
                        }
                        IrcLine::AuthFailed => {
                            return Err(DispatchError::Auth(
                                "Twitch rejected the OAuth token".to_owned(),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    use super::*;

    #[test]
    fn normalizes_login() {
        let login = Login::from_config(&TwitchConfig {
            enabled: true,
            token: "oauth:abc123".into(),
            channel: "#SomeStreamer".into(),
            nick: None,
        });

        assert_eq!(login.token, "abc123");
        assert_eq!(login.channel, "somestreamer");
        assert_eq!(login.nick, "somestreamer");
        assert_eq!(
            login.handshake(),
            [
                "PASS oauth:abc123".to_owned(),
                "NICK somestreamer".to_owned(),
                "JOIN #somestreamer".to_owned(),
            ]
        );
    }

    #[test]
    fn parses_server_lines() {
        assert_eq!(
            parse_line("PING :tmi.twitch.tv\r\n"),
            IrcLine::Ping(":tmi.twitch.tv")
        );
        assert_eq!(
            parse_line(":bot!bot@bot.tmi.twitch.tv JOIN #chan"),
            IrcLine::Joined("chan")
        );
        assert_eq!(
            parse_line("@badges=;color= :bot!bot@bot.tmi.twitch.tv JOIN #chan"),
            IrcLine::Joined("chan")
        );
        assert_eq!(
            parse_line(":tmi.twitch.tv NOTICE * :Login authentication failed"),
            IrcLine::AuthFailed
        );
        assert_eq!(
            parse_line(":tmi.twitch.tv 001 bot :Welcome, GLHF!"),
            IrcLine::Other
        );
    }

    #[test]
    fn sanitizes_outgoing_text() {
        assert_eq!(sanitize("a\r\nb"), "a  b");
        assert_eq!(sanitize(&"x".repeat(600)).len(), MAX_MESSAGE_CHARS);
    }

    /// Local stand-in for the Twitch chat server.
    struct ChatServer {
        listener: TcpListener,
        url: String,
    }

    impl ChatServer {
        async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}", listener.local_addr().unwrap());
            Self { listener, url }
        }

        async fn accept(&self) -> WebSocketStream<TcpStream> {
            let (tcp, _) = within(self.listener.accept()).await.unwrap();
            accept_async(tcp).await.unwrap()
        }
    }

    async fn next_line(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match within(ws.next()).await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }

    async fn within<T>(fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    async fn eventually<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    fn config() -> TwitchConfig {
        TwitchConfig {
            enabled: true,
            token: "oauth:abc".into(),
            channel: "#Chan".into(),
            nick: Some("relaybot".into()),
        }
    }

    #[tokio::test]
    async fn skips_send_until_joined() {
        let server = ChatServer::bind().await;
        let mut session = TwitchSession::start_at(server.url.clone(), &config());

        let mut ws = server.accept().await;
        assert_eq!(next_line(&mut ws).await, "PASS oauth:abc");
        assert_eq!(next_line(&mut ws).await, "NICK relaybot");
        assert_eq!(next_line(&mut ws).await, "JOIN #chan");

        let result = session.send("hello").await;
        assert!(matches!(result, Err(DispatchError::NotReady(_))));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn session_protocol() {
        let server = ChatServer::bind().await;
        let mut session = TwitchSession::start_at(server.url.clone(), &config());

        let mut ws = server.accept().await;
        for _ in 0..3 {
            next_line(&mut ws).await;
        }

        ws.send(Message::Text(
            ":relaybot!relaybot@relaybot.tmi.twitch.tv JOIN #chan\r\n".into(),
        ))
        .await
        .unwrap();
        let joined = session.joined.clone();
        eventually(|| joined.load(Ordering::Acquire)).await;

        ws.send(Message::Text("PING :tmi.twitch.tv\r\n".into()))
            .await
            .unwrap();
        assert_eq!(next_line(&mut ws).await, "PONG :tmi.twitch.tv");

        session.send("Thanks\nann1").await.unwrap();
        assert_eq!(next_line(&mut ws).await, "PRIVMSG #chan :Thanks ann1");

        ws.close(None).await.ok();
        drop(ws);
        eventually(|| !joined.load(Ordering::Acquire)).await;
        assert!(matches!(
            session.send("late").await,
            Err(DispatchError::NotReady(_))
        ));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_token_ends_session() {
        let server = ChatServer::bind().await;
        let session = TwitchSession::start_at(server.url.clone(), &config());

        let mut ws = server.accept().await;
        for _ in 0..3 {
            next_line(&mut ws).await;
        }
        ws.send(Message::Text(
            ":tmi.twitch.tv NOTICE * :Login authentication failed".into(),
        ))
        .await
        .unwrap();

        // The client drops the connection on its own.
        let ended = within(async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        });
        ended.await;
        assert!(!session.joined.load(Ordering::Acquire));
    }
}
