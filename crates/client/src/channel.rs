//! Client side of the command channel.
//!
//! Keeps one WebSocket open to the gateway, reconnecting with exponential
//! backoff. Commands are published into the [`CommandInbox`]; keep-alives
//! are dropped; anything else is an opaque reply surfaced on a broadcast
//! stream. A rejected credential is retried like any other failure, since
//! refreshing the token is up to the caller.
//!
//! A close with [`CLOSE_SUPERSEDED`] means another client signed in as the
//! same user. The channel stops there instead of reconnecting, otherwise two
//! clients would keep evicting each other.

use std::sync::Arc;
use std::time::Duration;

use capture_relay_protocol::{ServerFrame, ServerMessage, CLOSE_SUPERSEDED};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::inbox::CommandInbox;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `ws://` or `wss://` address of the gateway.
    pub url: String,
    pub token: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Gateway address with the credential in the `Auth` query parameter.
    pub fn connect_url(&self) -> Result<String, ChannelError> {
        let url = self.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ChannelError::InvalidUrl(url.to_string()));
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{url}{separator}Auth=Bearer+{}",
            urlencoding::encode(&self.token)
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Connecting, or waiting out the backoff before the next try.
    Connecting,
    Connected,
    /// The gateway handed this user's connection to another client. Terminal.
    Superseded,
    Stopped,
}

enum Disconnect {
    Closed,
    Superseded,
    HandleDropped,
}

pub struct CommandChannel {
    outbound: mpsc::Sender<String>,
    replies: broadcast::Sender<String>,
    status: watch::Receiver<ChannelStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CommandChannel {
    pub fn spawn(config: ChannelConfig, inbox: Arc<CommandInbox>) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(64);
        let (replies, _) = broadcast::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (status_tx, status) = watch::channel(ChannelStatus::Connecting);

        let task = tokio::spawn(run(
            config,
            inbox,
            outbound_rx,
            replies.clone(),
            status_tx,
            shutdown_rx,
        ));

        Self {
            outbound,
            replies,
            status,
            shutdown,
            task,
        }
    }

    /// Queue opaque text for the gateway's message handler. Text queued while
    /// disconnected is sent after the next successful connect.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.outbound
            .send(text.into())
            .await
            .map_err(|_| ChannelError::Closed)
    }

    pub fn subscribe_replies(&self) -> broadcast::Receiver<String> {
        self.replies.subscribe()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run(
    config: ChannelConfig,
    inbox: Arc<CommandInbox>,
    mut outbound_rx: mpsc::Receiver<String>,
    replies: broadcast::Sender<String>,
    status: watch::Sender<ChannelStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = config.initial_backoff;
    let mut attempts: u64 = 0;
    let mut last = ChannelStatus::Stopped;

    loop {
        attempts += 1;
        status.send_replace(ChannelStatus::Connecting);
        let outcome = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            outcome = connect_and_run(&config, &inbox, &mut outbound_rx, &replies, &status) => {
                outcome
            }
        };
        status.send_replace(ChannelStatus::Connecting);

        match outcome {
            Ok(Disconnect::HandleDropped) => break,
            Ok(Disconnect::Superseded) => {
                warn!(
                    component = "channel",
                    event = "channel.superseded",
                    "Another client took over this user's connection, not reconnecting"
                );
                last = ChannelStatus::Superseded;
                break;
            }
            Ok(Disconnect::Closed) => {
                info!(
                    component = "channel",
                    event = "channel.disconnected",
                    "Gateway closed the connection"
                );
                delay = config.initial_backoff;
            }
            Err(ChannelError::InvalidUrl(url)) => {
                warn!(
                    component = "channel",
                    event = "channel.invalid_url",
                    url = %url,
                    "Gateway url is not a websocket address, giving up"
                );
                break;
            }
            Err(e) => {
                warn!(
                    component = "channel",
                    event = "channel.connect_failed",
                    attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Gateway connection failed"
                );
            }
        }

        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(config.max_backoff);
    }

    status.send_replace(last);
    debug!(
        component = "channel",
        event = "channel.stopped",
        "Command channel stopped"
    );
}

async fn connect_and_run(
    config: &ChannelConfig,
    inbox: &CommandInbox,
    outbound_rx: &mut mpsc::Receiver<String>,
    replies: &broadcast::Sender<String>,
    status: &watch::Sender<ChannelStatus>,
) -> Result<Disconnect, ChannelError> {
    let url = config.connect_url()?;
    let (ws, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(connection) => connection,
        Err(tungstenite::Error::Http(response))
            if response.status() == StatusCode::UNAUTHORIZED =>
        {
            return Err(ChannelError::Unauthorized)
        }
        Err(e) => return Err(e.into()),
    };

    status.send_replace(ChannelStatus::Connected);
    info!(
        component = "channel",
        event = "channel.connected",
        "Connected to gateway"
    );

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else { return Ok(Disconnect::Closed) };
                match frame? {
                    Message::Text(text) => handle_frame(text.as_str(), inbox, replies),
                    Message::Close(Some(close)) if u16::from(close.code) == CLOSE_SUPERSEDED => {
                        return Ok(Disconnect::Superseded)
                    }
                    Message::Close(_) => return Ok(Disconnect::Closed),
                    _ => {}
                }
            }
            text = outbound_rx.recv() => {
                let Some(text) = text else {
                    let _ = sink.close().await;
                    return Ok(Disconnect::HandleDropped);
                };
                sink.send(Message::Text(text.into())).await?;
            }
        }
    }
}

fn handle_frame(text: &str, inbox: &CommandInbox, replies: &broadcast::Sender<String>) {
    match ServerFrame::parse(text) {
        ServerFrame::Message(ServerMessage::AgentCommand { payload }) => {
            info!(
                component = "channel",
                event = "channel.command.received",
                command_id = %payload.command_id,
                action = %payload.action,
                "Received command"
            );
            inbox.publish(payload);
        }
        ServerFrame::Message(ServerMessage::Ping) => {}
        ServerFrame::Malformed { error } => {
            warn!(
                component = "channel",
                event = "channel.protocol_violation",
                error = %error,
                "Ignoring malformed command"
            );
        }
        ServerFrame::Opaque(text) => {
            let _ = replies.send(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_relay_protocol::{CaptureAction, CommandEnvelope};
    use tokio::net::TcpListener;
    use tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn connect_url_carries_encoded_credential() {
        let config = ChannelConfig::new("wss://relay.example/ws", "a b/c");
        assert_eq!(
            config.connect_url().unwrap(),
            "wss://relay.example/ws?Auth=Bearer+a%20b%2Fc"
        );

        let config = ChannelConfig::new("ws://relay.example/?v=2", "t");
        assert_eq!(
            config.connect_url().unwrap(),
            "ws://relay.example/?v=2&Auth=Bearer+t"
        );
    }

    #[test]
    fn connect_url_rejects_http() {
        let config = ChannelConfig::new("https://relay.example", "t");
        assert!(matches!(
            config.connect_url(),
            Err(ChannelError::InvalidUrl(_))
        ));
    }

    #[test]
    fn frames_are_routed_by_kind() {
        let inbox = CommandInbox::new();
        let (replies, mut reply_rx) = broadcast::channel(4);

        let command = ServerMessage::command(CommandEnvelope::new("cmd_1", CaptureAction::Start));
        handle_frame(&command.to_json().unwrap(), &inbox, &replies);
        handle_frame(r#"{"type":"ping"}"#, &inbox, &replies);
        handle_frame(r#"{"type":"AGENT_COMMAND","payload":{"action":"DANCE"}}"#, &inbox, &replies);
        handle_frame("Your note is saved", &inbox, &replies);

        assert_eq!(inbox.consume().unwrap().command_id, "cmd_1");
        assert_eq!(reply_rx.try_recv().unwrap(), "Your note is saved");
        assert!(reply_rx.try_recv().is_err());
    }

    /// Accepts one websocket, pushes a command, echoes one text frame back.
    async fn fake_gateway() -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut uri_tx = Some(uri_tx);
            let callback = |req: &Request, resp: Response| {
                if let Some(tx) = uri_tx.take() {
                    let _ = tx.send(req.uri().to_string());
                }
                Ok::<_, ErrorResponse>(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            let push = ServerMessage::command(CommandEnvelope::new("cmd_42", CaptureAction::Stop));
            ws.send(Message::Text(push.to_json().unwrap().into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
                .await
                .unwrap();

            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    ws.send(Message::Text(format!("ack:{}", text.as_str()).into()))
                        .await
                        .unwrap();
                }
            }
        });

        (format!("ws://{addr}/"), uri_rx)
    }

    #[tokio::test]
    async fn receives_commands_and_replies() {
        let (url, uri_rx) = fake_gateway().await;
        let inbox = Arc::new(CommandInbox::new());
        let channel = CommandChannel::spawn(ChannelConfig::new(url, "tok en"), inbox.clone());
        let mut replies = channel.subscribe_replies();

        let uri = tokio::time::timeout(Duration::from_secs(2), uri_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uri, "/?Auth=Bearer+tok%20en");

        tokio::time::timeout(Duration::from_secs(2), inbox.wait())
            .await
            .unwrap();
        assert_eq!(inbox.consume().unwrap().command_id, "cmd_42");
        assert!(channel.is_connected());

        channel.send_text("hello").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "ack:hello");

        tokio::time::timeout(Duration::from_secs(2), channel.shutdown())
            .await
            .unwrap();
    }

    /// Accepts every websocket and immediately closes it as superseded.
    async fn evicting_gateway() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                ws.close(Some(tungstenite::protocol::CloseFrame {
                    code: CLOSE_SUPERSEDED.into(),
                    reason: "superseded".into(),
                }))
                .await
                .unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            }
        });

        (format!("ws://{addr}/"), accepted)
    }

    #[tokio::test]
    async fn superseded_close_stops_reconnecting() {
        let (url, accepted) = evicting_gateway().await;
        let inbox = Arc::new(CommandInbox::new());
        let mut config = ChannelConfig::new(url, "t");
        config.initial_backoff = Duration::from_millis(10);
        config.max_backoff = Duration::from_millis(20);
        let channel = CommandChannel::spawn(config, inbox);

        let mut status = channel.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| *s == ChannelStatus::Superseded),
        )
        .await
        .unwrap()
        .unwrap();

        // Plenty of time for several retries if the channel were still trying.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(channel.status(), ChannelStatus::Superseded);
        assert!(!channel.is_connected());

        tokio::time::timeout(Duration::from_secs(1), channel.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_retrying_until_shutdown() {
        // Nothing listens here once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let inbox = Arc::new(CommandInbox::new());
        let mut config = ChannelConfig::new(format!("ws://{addr}/"), "t");
        config.initial_backoff = Duration::from_millis(10);
        config.max_backoff = Duration::from_millis(40);
        let channel = CommandChannel::spawn(config, inbox);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!channel.is_connected());
        assert_eq!(channel.status(), ChannelStatus::Connecting);

        tokio::time::timeout(Duration::from_secs(1), channel.shutdown())
            .await
            .expect("shutdown interrupts backoff");
    }
}
