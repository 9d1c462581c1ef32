use thiserror::Error;

/// Why a capture device could not be acquired or stopped working.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture device failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("upload response invalid: {0}")]
    InvalidResponse(String),
}

impl UploadError {
    /// The failure reason as the backend or transport stated it, without
    /// the variant prefix. This is what the session shows the user.
    pub fn reason(&self) -> String {
        match self {
            Self::Transport(e) => e.to_string(),
            Self::Rejected { message, .. } => message.clone(),
            Self::InvalidResponse(message) => message.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("gateway rejected credential")]
    Unauthorized,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("channel is shut down")]
    Closed,
}
