//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};

/// Command vocabulary an agent can push to a connected client.
///
/// The `*_RECORDING_SESSION` names are what older agents emit; they decode to
/// the same actions but are never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureAction {
    #[serde(rename = "START_CAPTURE", alias = "START_RECORDING_SESSION")]
    Start,
    #[serde(rename = "STOP_CAPTURE", alias = "STOP_RECORDING_SESSION")]
    Stop,
    #[serde(rename = "CANCEL_CAPTURE", alias = "CANCEL_RECORDING_SESSION")]
    Cancel,
}

impl CaptureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureAction::Start => "START_CAPTURE",
            CaptureAction::Stop => "STOP_CAPTURE",
            CaptureAction::Cancel => "CANCEL_CAPTURE",
        }
    }
}

impl fmt::Display for CaptureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional hints attached to a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_title: Option<String>,
    #[serde(
        default,
        alias = "linkedEventId",
        skip_serializing_if = "Option::is_none"
    )]
    pub linked_entity_id: Option<String>,
}

impl CommandPayload {
    pub fn is_empty(&self) -> bool {
        self.suggested_title.is_none() && self.linked_entity_id.is_none()
    }
}

/// A command pushed from an agent to a user's client.
///
/// `command_id` is not checked for uniqueness by the channel; consumers that
/// need idempotency track ids themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub action: CaptureAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<CommandPayload>,
}

impl CommandEnvelope {
    pub fn new(command_id: impl Into<String>, action: CaptureAction) -> Self {
        Self {
            command_id: command_id.into(),
            action,
            payload: None,
        }
    }

    /// Attach a payload. Empty payloads are dropped so they never hit the wire.
    pub fn with_payload(mut self, payload: CommandPayload) -> Self {
        self.payload = (!payload.is_empty()).then_some(payload);
        self
    }

    pub fn suggested_title(&self) -> Option<&str> {
        self.payload.as_ref()?.suggested_title.as_deref()
    }

    pub fn linked_entity_id(&self) -> Option<&str> {
        self.payload.as_ref()?.linked_entity_id.as_deref()
    }
}
