//! Capture Relay client
//!
//! Receives capture commands from the gateway and drives a single capture
//! session: permission, capture, stop, upload. Commands arriving over the
//! channel land in a one-slot [`CommandInbox`]; the session actor drains it
//! and applies each command with the same guards as local actions.

pub mod channel;
pub mod device;
pub mod error;
pub mod inbox;
pub mod session_actor;
pub mod transition;
pub mod upload;

pub use channel::{ChannelConfig, ChannelStatus, CommandChannel};
pub use device::{ActiveCapture, CaptureDevice, ChunkSink};
pub use error::{ChannelError, DeviceError, UploadError};
pub use inbox::CommandInbox;
pub use session_actor::{CaptureEvent, CaptureSessionConfig, CaptureSessionHandle};
pub use transition::{CaptureState, CaptureStatus};
pub use upload::{HttpUploader, UploadReceipt, UploadRequest, Uploader};
