//! Capture device seam.
//!
//! The session actor acquires a device when a capture is accepted, feeds it a
//! [`ChunkSink`] tagged with the attempt, and releases it on every exit path.
//! Acquisition may block on a user permission prompt, so it runs off the
//! actor task and reports back through the actor's channel.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::DeviceError;

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Ask for access and start producing data into `sink`.
    async fn acquire(&self, sink: ChunkSink) -> Result<Box<dyn ActiveCapture>, DeviceError>;
}

/// A device that is currently held.
pub trait ActiveCapture: Send {
    /// Stop producing data, returning any buffered final chunk.
    fn stop(&mut self) -> Option<Bytes>;

    /// Give the device back. Must be safe to call more than once.
    fn release(&mut self);
}

/// What a held device reports while a capture is running.
#[derive(Debug)]
pub(crate) enum SinkEvent {
    Chunk(Bytes),
    Failed(DeviceError),
}

/// Where a held device delivers its data.
///
/// Each attempt gets its own unbounded channel, so nothing a device reports
/// is lost while the attempt is live. The session drops the receiving end
/// when the attempt ends, after which every delivery is refused.
#[derive(Clone)]
pub struct ChunkSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChunkSink {
    pub(crate) fn channel(attempt: u64) -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { attempt, tx }, rx)
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Deliver a chunk. Returns `false` once the attempt has ended, either
    /// because the capture finished or was abandoned or the session is gone.
    pub fn push(&self, data: Bytes) -> bool {
        self.tx.send(SinkEvent::Chunk(data)).is_ok()
    }

    /// Report that the device stopped working mid-capture. Same return
    /// contract as [`push`](Self::push).
    pub fn fail(&self, error: DeviceError) -> bool {
        self.tx.send(SinkEvent::Failed(error)).is_ok()
    }

    /// True once the session no longer listens for this attempt.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
