//! Per-connection keep-alive probe.
//!
//! Sends `{"type":"ping"}` on a fixed interval so proxies and load balancers
//! see traffic and reap half-open sockets. Carries no application meaning;
//! clients do not answer.

use std::time::Duration;

use capture_relay_protocol::ServerMessage;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::registry::{ConnectionHandle, Outbound};

pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(50);

/// Running probe for one connection. Dropping it stops the timer.
pub struct KeepAliveMonitor {
    task: JoinHandle<()>,
}

impl KeepAliveMonitor {
    pub fn spawn(connection: ConnectionHandle, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let probe = match ServerMessage::Ping.to_json() {
                Ok(json) => json,
                Err(_) => return,
            };
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !connection.is_writable() {
                    debug!(
                        component = "keepalive",
                        event = "keepalive.stopped",
                        connection_id = connection.id(),
                        "Connection no longer writable, stopping keep-alive"
                    );
                    break;
                }
                if !connection.try_send(Outbound::Text(probe.clone())) {
                    debug!(
                        component = "keepalive",
                        event = "keepalive.skipped",
                        connection_id = connection.id(),
                        "Outbound queue full, skipped keep-alive"
                    );
                    continue;
                }
                trace!(
                    component = "keepalive",
                    connection_id = connection.id(),
                    "Sent keep-alive"
                );
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for KeepAliveMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
