//! Routing of client → server text frames to the message handler.
//!
//! The gateway does not interpret what clients send. Each text frame goes to
//! an [`InboundHandler`] together with the sender's identity and a dispatcher,
//! and whatever the handler returns is written back on the same connection.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::dispatch::CommandDispatcher;

/// What a handler knows about the frame it is handling.
#[derive(Clone)]
pub struct InboundContext {
    pub identity: String,
    pub connection_id: u64,
    /// Lets a handler push commands back to this (or any) user.
    pub dispatcher: CommandDispatcher,
}

#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one message. `Ok(Some(reply))` is sent back verbatim.
    async fn handle(
        &self,
        ctx: &InboundContext,
        message: String,
    ) -> anyhow::Result<Option<String>>;
}

/// Accepts and drops every message.
pub struct NoopHandler;

#[async_trait]
impl InboundHandler for NoopHandler {
    async fn handle(
        &self,
        ctx: &InboundContext,
        message: String,
    ) -> anyhow::Result<Option<String>> {
        debug!(
            component = "inbound",
            event = "inbound.dropped",
            user_id = %ctx.identity,
            connection_id = ctx.connection_id,
            payload_bytes = message.len(),
            "No message handler configured"
        );
        Ok(None)
    }
}

#[derive(Serialize)]
struct ForwardBody<'a> {
    user_id: &'a str,
    message: &'a str,
}

/// Forwards each message to an HTTP endpoint owned by the agent process.
/// A non-empty response body becomes the reply.
pub struct HttpForwardHandler {
    client: reqwest::Client,
    url: String,
}

impl HttpForwardHandler {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl InboundHandler for HttpForwardHandler {
    async fn handle(
        &self,
        ctx: &InboundContext,
        message: String,
    ) -> anyhow::Result<Option<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(&ForwardBody {
                user_id: &ctx.identity,
                message: &message,
            })
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn noop_handler_never_replies() {
        let ctx = InboundContext {
            identity: "u1".into(),
            connection_id: 1,
            dispatcher: CommandDispatcher::new(Arc::new(ConnectionRegistry::new())),
        };
        let reply = NoopHandler.handle(&ctx, "hello".into()).await.unwrap();
        assert!(reply.is_none());
    }

    async fn serve_agent(reply: &'static str) -> String {
        use axum::{routing::post, Json, Router};

        let app = Router::new().route(
            "/agent",
            post(move |Json(body): Json<serde_json::Value>| async move {
                if reply.is_empty() {
                    String::new()
                } else {
                    format!(
                        "{}:{}:{}",
                        reply,
                        body["user_id"].as_str().unwrap_or(""),
                        body["message"].as_str().unwrap_or("")
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/agent")
    }

    fn ctx() -> InboundContext {
        InboundContext {
            identity: "u7".into(),
            connection_id: 3,
            dispatcher: CommandDispatcher::new(Arc::new(ConnectionRegistry::new())),
        }
    }

    #[tokio::test]
    async fn forward_handler_returns_agent_reply() {
        let handler = HttpForwardHandler::new(serve_agent("ok").await).unwrap();
        let reply = handler.handle(&ctx(), "record this".into()).await.unwrap();
        assert_eq!(reply.as_deref(), Some("ok:u7:record this"));
    }

    #[tokio::test]
    async fn forward_handler_treats_empty_body_as_no_reply() {
        let handler = HttpForwardHandler::new(serve_agent("").await).unwrap();
        let reply = handler.handle(&ctx(), "hi".into()).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn forward_handler_surfaces_http_errors() {
        let handler = HttpForwardHandler::new("http://127.0.0.1:9/unreachable").unwrap();
        assert!(handler.handle(&ctx(), "hi".into()).await.is_err());
    }
}
