//! Agent-side helpers for driving a user's capture session.
//!
//! Each helper builds a command, dispatches it, and phrases the outcome for
//! the user. Delivery is best-effort: a successful reply only means the app
//! was reachable when the command was sent.

use capture_relay_protocol::{new_command_id, CaptureAction, CommandEnvelope, CommandPayload};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::dispatch::CommandDispatcher;

const UNREACHABLE_MESSAGE: &str =
    "I couldn't reach your app right now. Make sure it's open and connected, then try again.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillReply {
    pub success: bool,
    pub message: String,
    pub command_id: String,
}

pub fn default_title() -> String {
    format!(
        "Audio Note {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Build the START command for a capture. Blank titles fall back to a
/// timestamped default.
pub fn start_command(title: Option<&str>, linked_entity_id: Option<&str>) -> CommandEnvelope {
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(default_title);
    let linked_entity_id = linked_entity_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    CommandEnvelope::new(new_command_id(), CaptureAction::Start).with_payload(CommandPayload {
        suggested_title: Some(title),
        linked_entity_id,
    })
}

#[derive(Clone)]
pub struct CaptureNoteSkill {
    dispatcher: CommandDispatcher,
}

impl CaptureNoteSkill {
    pub fn new(dispatcher: CommandDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn start(
        &self,
        identity: &str,
        title: Option<&str>,
        linked_entity_id: Option<&str>,
    ) -> SkillReply {
        let command = start_command(title, linked_entity_id);
        let message = format!(
            "Okay, starting an audio note titled \"{}\". Please check the app.",
            command.suggested_title().unwrap_or_default()
        );
        self.send(identity, command, message)
    }

    pub fn stop(&self, identity: &str) -> SkillReply {
        self.send(
            identity,
            CommandEnvelope::new(new_command_id(), CaptureAction::Stop),
            "Okay, stopping the recording. The note will be processed shortly if a recording was active."
                .to_string(),
        )
    }

    pub fn cancel(&self, identity: &str) -> SkillReply {
        self.send(
            identity,
            CommandEnvelope::new(new_command_id(), CaptureAction::Cancel),
            "Okay, I've cancelled the audio note.".to_string(),
        )
    }

    fn send(&self, identity: &str, command: CommandEnvelope, on_success: String) -> SkillReply {
        let command_id = command.command_id.clone();
        let success = self.dispatcher.dispatch_command(identity, command);
        SkillReply {
            success,
            message: if success {
                on_success
            } else {
                UNREACHABLE_MESSAGE.to_string()
            },
            command_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
    use capture_relay_protocol::{ServerFrame, ServerMessage};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn skill() -> (CaptureNoteSkill, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        (
            CaptureNoteSkill::new(CommandDispatcher::new(registry.clone())),
            registry,
        )
    }

    #[test]
    fn start_command_defaults_blank_title() {
        let cmd = start_command(Some("   "), Some(""));
        assert_eq!(cmd.action, CaptureAction::Start);
        assert!(cmd.suggested_title().unwrap().starts_with("Audio Note "));
        assert!(cmd.linked_entity_id().is_none());
        assert!(cmd.command_id.starts_with("cmd_"));
    }

    #[test]
    fn start_command_keeps_given_title_and_link() {
        let cmd = start_command(Some(" Design review "), Some("evt-3"));
        assert_eq!(cmd.suggested_title(), Some("Design review"));
        assert_eq!(cmd.linked_entity_id(), Some("evt-3"));
    }

    #[test]
    fn unreachable_user_gets_failure_reply() {
        let (skill, _registry) = skill();
        let reply = skill.start("u1", Some("Notes"), None);
        assert!(!reply.success);
        assert_eq!(reply.message, UNREACHABLE_MESSAGE);
    }

    #[test]
    fn connected_user_receives_command() {
        let (skill, registry) = skill();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(ConnectionHandle::new("u1", tx));

        let reply = skill.stop("u1");
        assert!(reply.success);

        let Ok(Outbound::Text(json)) = rx.try_recv() else {
            panic!("expected a text frame");
        };
        match ServerFrame::parse(&json) {
            ServerFrame::Message(ServerMessage::AgentCommand { payload }) => {
                assert_eq!(payload.action, CaptureAction::Stop);
                assert_eq!(payload.command_id, reply.command_id);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
