//! Fire-and-forget command delivery to a user's live connection.

use std::sync::Arc;

use capture_relay_protocol::{CommandEnvelope, ServerMessage};
use tracing::{error, info, warn};

use crate::registry::{ConnectionRegistry, Outbound};

/// Pushes commands to connected clients. Cheap to clone.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `command` to `identity`'s connection.
    ///
    /// Returns `false` when there is no registered connection or it cannot
    /// take a write right now. `true` only means the frame was handed to the
    /// connection's writer; the client may still never act on it.
    pub fn dispatch_command(&self, identity: &str, command: CommandEnvelope) -> bool {
        let action = command.action;
        let command_id = command.command_id.clone();

        let Some(connection) = self.registry.lookup(identity) else {
            warn!(
                component = "dispatch",
                event = "dispatch.no_connection",
                user_id = %identity,
                command_id = %command_id,
                command_action = %action,
                "No active connection for user"
            );
            return false;
        };

        if !connection.is_writable() {
            warn!(
                component = "dispatch",
                event = "dispatch.not_writable",
                user_id = %identity,
                connection_id = connection.id(),
                command_id = %command_id,
                command_action = %action,
                "Connection is not writable"
            );
            return false;
        }

        let json = match ServerMessage::command(command).to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(
                    component = "dispatch",
                    event = "dispatch.serialize_failed",
                    user_id = %identity,
                    command_id = %command_id,
                    error = %e,
                    "Failed to serialize command"
                );
                return false;
            }
        };

        let delivered = connection.try_send(Outbound::Text(json));
        if delivered {
            info!(
                component = "dispatch",
                event = "dispatch.sent",
                user_id = %identity,
                connection_id = connection.id(),
                command_id = %command_id,
                command_action = %action,
                "Sent command to user"
            );
        } else {
            warn!(
                component = "dispatch",
                event = "dispatch.write_failed",
                user_id = %identity,
                connection_id = connection.id(),
                command_id = %command_id,
                command_action = %action,
                "Outbound queue full or closed"
            );
        }
        delivered
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
