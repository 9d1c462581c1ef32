//! One-slot command inbox.
//!
//! Holds at most one unconsumed command. A publish replaces whatever has not
//! been consumed yet, so under bursts only the latest command survives.

use std::sync::Mutex;

use capture_relay_protocol::CommandEnvelope;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
pub struct CommandInbox {
    slot: Mutex<Option<CommandEnvelope>>,
    notify: Notify,
}

impl CommandInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, command: CommandEnvelope) {
        let replaced = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(command)
        };
        if let Some(old) = replaced {
            debug!(
                component = "inbox",
                event = "inbox.command.overwritten",
                command_id = %old.command_id,
                action = %old.action,
                "Unconsumed command replaced"
            );
        }
        self.notify.notify_one();
    }

    pub fn peek(&self) -> Option<CommandEnvelope> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn consume(&self) -> Option<CommandEnvelope> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Resolves once a publish has happened since the previous `wait`.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_relay_protocol::CaptureAction;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn consume_clears_slot() {
        let inbox = CommandInbox::new();
        inbox.publish(CommandEnvelope::new("cmd_1", CaptureAction::Start));

        assert_eq!(inbox.peek().unwrap().command_id, "cmd_1");
        assert_eq!(inbox.consume().unwrap().command_id, "cmd_1");
        assert!(inbox.peek().is_none());
        assert!(inbox.consume().is_none());
    }

    #[test]
    fn latest_publish_wins() {
        let inbox = CommandInbox::new();
        inbox.publish(CommandEnvelope::new("cmd_1", CaptureAction::Start));
        inbox.publish(CommandEnvelope::new("cmd_2", CaptureAction::Stop));

        let only = inbox.consume().unwrap();
        assert_eq!(only.command_id, "cmd_2");
        assert_eq!(only.action, CaptureAction::Stop);
        assert!(inbox.consume().is_none());
    }

    #[tokio::test]
    async fn wait_sees_publish_made_before_waiting() {
        let inbox = CommandInbox::new();
        inbox.publish(CommandEnvelope::new("cmd_1", CaptureAction::Cancel));
        tokio::time::timeout(Duration::from_secs(1), inbox.wait())
            .await
            .expect("stored permit wakes waiter");
    }

    #[tokio::test]
    async fn wait_wakes_on_later_publish() {
        let inbox = Arc::new(CommandInbox::new());
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                inbox.wait().await;
                inbox.consume()
            })
        };
        tokio::task::yield_now().await;
        inbox.publish(CommandEnvelope::new("cmd_7", CaptureAction::Start));

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().command_id, "cmd_7");
    }
}
