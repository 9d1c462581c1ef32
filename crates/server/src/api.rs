//! HTTP endpoints next to the WebSocket: health and command dispatch.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use capture_relay_protocol::{
    new_command_id, CaptureAction, CommandEnvelope, CommandPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
    }))
}

/// Body of `POST /api/users/{identity}/commands`: either a complete envelope
/// or just an action plus hints, in which case an id is generated. Hints are
/// accepted in snake_case or in the camelCase used on the wire.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DispatchRequest {
    Envelope(CommandEnvelope),
    Action {
        action: CaptureAction,
        #[serde(default, alias = "suggestedTitle")]
        suggested_title: Option<String>,
        #[serde(default, alias = "linkedEntityId")]
        linked_entity_id: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchResponse {
    pub delivered: bool,
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    Json(request): Json<DispatchRequest>,
) -> Json<DispatchResponse> {
    let response = match request {
        DispatchRequest::Envelope(envelope) => {
            let command_id = envelope.command_id.clone();
            DispatchResponse {
                delivered: state.dispatcher.dispatch_command(&identity, envelope),
                command_id,
                message: None,
            }
        }
        DispatchRequest::Action {
            action: CaptureAction::Start,
            suggested_title,
            linked_entity_id,
        } => {
            let reply = state.skill.start(
                &identity,
                suggested_title.as_deref(),
                linked_entity_id.as_deref(),
            );
            DispatchResponse {
                delivered: reply.success,
                command_id: reply.command_id,
                message: Some(reply.message),
            }
        }
        DispatchRequest::Action {
            action,
            suggested_title,
            linked_entity_id,
        } if suggested_title.is_some() || linked_entity_id.is_some() => {
            let envelope = CommandEnvelope::new(new_command_id(), action).with_payload(
                CommandPayload {
                    suggested_title,
                    linked_entity_id,
                },
            );
            let command_id = envelope.command_id.clone();
            DispatchResponse {
                delivered: state.dispatcher.dispatch_command(&identity, envelope),
                command_id,
                message: None,
            }
        }
        DispatchRequest::Action { action, .. } => {
            let reply = match action {
                CaptureAction::Stop => state.skill.stop(&identity),
                _ => state.skill.cancel(&identity),
            };
            DispatchResponse {
                delivered: reply.success,
                command_id: reply.command_id,
                message: Some(reply.message),
            }
        }
    };

    Json(response)
}
