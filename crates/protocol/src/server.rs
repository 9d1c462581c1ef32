//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::CommandEnvelope;

/// `type` tag of a pushed command
pub const AGENT_COMMAND_TYPE: &str = "AGENT_COMMAND";

/// Close code for a connection replaced by a newer one for the same user.
/// Clients seeing it should not reconnect on their own.
pub const CLOSE_SUPERSEDED: u16 = 4001;
pub const CLOSE_SUPERSEDED_REASON: &str = "superseded";

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Command pushed by an agent
    #[serde(rename = "AGENT_COMMAND")]
    AgentCommand { payload: CommandEnvelope },

    /// Keep-alive probe. Clients are not expected to answer.
    #[serde(rename = "ping")]
    Ping,
}

impl ServerMessage {
    pub fn command(envelope: CommandEnvelope) -> Self {
        ServerMessage::AgentCommand { payload: envelope }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// How a client should treat one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Message(ServerMessage),
    /// Tagged as a command but the envelope did not decode.
    Malformed { error: String },
    /// Anything else: a reply from the server-side message handler.
    Opaque(String),
}

impl ServerFrame {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed == "ping" || trimmed == "\"ping\"" {
            return ServerFrame::Message(ServerMessage::Ping);
        }

        match serde_json::from_str::<ServerMessage>(trimmed) {
            Ok(msg) => ServerFrame::Message(msg),
            Err(e) => {
                let tagged_as_command = serde_json::from_str::<Value>(trimmed)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_owned))
                    .is_some_and(|t| t == AGENT_COMMAND_TYPE);
                if tagged_as_command {
                    ServerFrame::Malformed {
                        error: e.to_string(),
                    }
                } else {
                    ServerFrame::Opaque(text.to_string())
                }
            }
        }
    }
}
