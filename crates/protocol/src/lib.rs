//! Capture Relay Protocol
//!
//! Shared types for communication between the capture relay gateway and its
//! clients. These types are serialized as JSON over WebSocket.

use uuid::Uuid;

pub mod server;
pub mod types;

pub use server::{
    ServerFrame, ServerMessage, AGENT_COMMAND_TYPE, CLOSE_SUPERSEDED, CLOSE_SUPERSEDED_REASON,
};
pub use types::*;

/// Generate a command id in the `cmd_<uuid>` form agents use.
pub fn new_command_id() -> String {
    format!("cmd_{}", Uuid::new_v4().simple())
}
