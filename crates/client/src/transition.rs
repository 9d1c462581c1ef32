//! Pure capture session transitions
//!
//! `transition(state, input) -> (state, effects)` holds every guard of the
//! capture lifecycle. It performs no IO; the session actor executes the
//! returned effects (device, ticker, upload, events).

use bytes::Bytes;

use crate::error::DeviceError;

/// Message used when a stop produced no data.
pub const EMPTY_CAPTURE_MESSAGE: &str = "Nothing was captured";

// ---------------------------------------------------------------------------
// CaptureStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStatus {
    Idle,
    AwaitingPermission,
    Capturing,
    Stopped,
    Uploading,
    Error,
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Idle => "idle",
            CaptureStatus::AwaitingPermission => "awaiting_permission",
            CaptureStatus::Capturing => "capturing",
            CaptureStatus::Stopped => "stopped",
            CaptureStatus::Uploading => "uploading",
            CaptureStatus::Error => "error",
        }
    }

    fn accepts_start(&self) -> bool {
        matches!(self, CaptureStatus::Idle | CaptureStatus::Error)
    }

    fn accepts_cancel(&self) -> bool {
        matches!(
            self,
            CaptureStatus::AwaitingPermission | CaptureStatus::Capturing | CaptureStatus::Stopped
        )
    }
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureState {
    pub status: CaptureStatus,
    pub title: String,
    pub linked_entity_id: Option<String>,
    pub elapsed_seconds: u64,
    pub captured_payload: Option<Bytes>,
    pub error_message: Option<String>,
    /// Bumped on every accepted start; results tagged with an older value are stale.
    pub attempt: u64,
    default_title: String,
}

impl CaptureState {
    pub fn new(default_title: impl Into<String>) -> Self {
        let default_title = default_title.into();
        Self {
            status: CaptureStatus::Idle,
            title: default_title.clone(),
            linked_entity_id: None,
            elapsed_seconds: 0,
            captured_payload: None,
            error_message: None,
            attempt: 0,
            default_title,
        }
    }

    pub fn default_title(&self) -> &str {
        &self.default_title
    }

    /// Back to `Idle` with no elapsed time, payload or error. The title and
    /// linked entity survive only when `preserve_title` is set.
    pub fn reset(&mut self, preserve_title: bool) {
        self.status = CaptureStatus::Idle;
        self.elapsed_seconds = 0;
        self.captured_payload = None;
        self.error_message = None;
        if !preserve_title {
            self.title = self.default_title.clone();
            self.linked_entity_id = None;
        }
    }

    fn is_current(&self, attempt: u64, status: CaptureStatus) -> bool {
        self.attempt == attempt && self.status == status
    }

    fn fail(&mut self, message: String) -> Vec<Effect> {
        self.reset(true);
        self.status = CaptureStatus::Error;
        self.error_message = Some(message.clone());
        vec![Effect::ReleaseResources, Effect::Failed { message }]
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Where an action came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote { command_id: String },
}

#[derive(Debug, Clone)]
pub enum Input {
    Start {
        suggested_title: Option<String>,
        linked_entity_id: Option<String>,
        origin: Origin,
    },
    Stop {
        origin: Origin,
    },
    Cancel {
        origin: Origin,
    },
    SetTitle(String),
    PermissionGranted {
        attempt: u64,
    },
    PermissionDenied {
        attempt: u64,
        error: DeviceError,
    },
    Tick {
        attempt: u64,
    },
    DeviceFailed {
        attempt: u64,
        error: DeviceError,
    },
    CaptureFinished {
        attempt: u64,
        payload: Bytes,
    },
    UploadSucceeded {
        attempt: u64,
        artifact: String,
    },
    UploadFailed {
        attempt: u64,
        message: String,
    },
    Teardown,
}

impl Input {
    fn name(&self) -> &'static str {
        match self {
            Input::Start { .. } => "start",
            Input::Stop { .. } => "stop",
            Input::Cancel { .. } => "cancel",
            Input::SetTitle(_) => "set_title",
            Input::PermissionGranted { .. } => "permission_granted",
            Input::PermissionDenied { .. } => "permission_denied",
            Input::Tick { .. } => "tick",
            Input::DeviceFailed { .. } => "device_failed",
            Input::CaptureFinished { .. } => "capture_finished",
            Input::UploadSucceeded { .. } => "upload_succeeded",
            Input::UploadFailed { .. } => "upload_failed",
            Input::Teardown => "teardown",
        }
    }
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Begin acquiring the device for this attempt.
    RequestDevice { attempt: u64 },
    /// Keep the device that was just granted.
    AdoptDevice { attempt: u64 },
    StartTicker { attempt: u64 },
    /// Stop the ticker, stop and release the device, then report the
    /// assembled payload back as `Input::CaptureFinished`.
    FinishCapture { attempt: u64 },
    Upload {
        attempt: u64,
        payload: Bytes,
        title: String,
        linked_entity_id: Option<String>,
    },
    /// Abort the ticker and any pending acquisition or upload, release the device.
    ReleaseResources,
    Completed { artifact: String },
    Failed { message: String },
    Ignored {
        input: &'static str,
        status: CaptureStatus,
        origin: Option<Origin>,
    },
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

pub fn transition(mut state: CaptureState, input: Input) -> (CaptureState, Vec<Effect>) {
    let status = state.status;
    let name = input.name();
    let ignored = |origin: Option<Origin>| {
        vec![Effect::Ignored {
            input: name,
            status,
            origin,
        }]
    };

    let effects = match input {
        Input::Start {
            suggested_title,
            linked_entity_id,
            origin,
        } => {
            if !status.accepts_start() {
                return (state, ignored(Some(origin)));
            }
            if let Some(title) = suggested_title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
            {
                state.title = title.to_string();
            }
            if let Some(linked) = linked_entity_id {
                state.linked_entity_id = Some(linked);
            }
            state.attempt += 1;
            state.elapsed_seconds = 0;
            state.captured_payload = None;
            state.error_message = None;
            state.status = CaptureStatus::AwaitingPermission;
            vec![Effect::RequestDevice {
                attempt: state.attempt,
            }]
        }

        Input::PermissionGranted { attempt } => {
            if !state.is_current(attempt, CaptureStatus::AwaitingPermission) {
                return (state, ignored(None));
            }
            state.status = CaptureStatus::Capturing;
            state.elapsed_seconds = 0;
            vec![
                Effect::AdoptDevice { attempt },
                Effect::StartTicker { attempt },
            ]
        }

        Input::PermissionDenied { attempt, error } => {
            if !state.is_current(attempt, CaptureStatus::AwaitingPermission) {
                return (state, ignored(None));
            }
            state.fail(error.to_string())
        }

        Input::Tick { attempt } => {
            if !state.is_current(attempt, CaptureStatus::Capturing) {
                return (state, ignored(None));
            }
            state.elapsed_seconds += 1;
            Vec::new()
        }

        Input::DeviceFailed { attempt, error } => {
            if !state.is_current(attempt, CaptureStatus::Capturing) {
                return (state, ignored(None));
            }
            state.fail(error.to_string())
        }

        Input::Stop { origin } => {
            if status != CaptureStatus::Capturing {
                return (state, ignored(Some(origin)));
            }
            state.status = CaptureStatus::Stopped;
            vec![Effect::FinishCapture {
                attempt: state.attempt,
            }]
        }

        Input::CaptureFinished { attempt, payload } => {
            if !state.is_current(attempt, CaptureStatus::Stopped) {
                return (state, ignored(None));
            }
            if payload.is_empty() {
                state.fail(EMPTY_CAPTURE_MESSAGE.to_string())
            } else {
                state.captured_payload = Some(payload.clone());
                state.status = CaptureStatus::Uploading;
                vec![Effect::Upload {
                    attempt,
                    payload,
                    title: state.title.clone(),
                    linked_entity_id: state.linked_entity_id.clone(),
                }]
            }
        }

        Input::UploadSucceeded { attempt, artifact } => {
            if !state.is_current(attempt, CaptureStatus::Uploading) {
                return (state, ignored(None));
            }
            state.reset(false);
            vec![Effect::ReleaseResources, Effect::Completed { artifact }]
        }

        Input::UploadFailed { attempt, message } => {
            if !state.is_current(attempt, CaptureStatus::Uploading) {
                return (state, ignored(None));
            }
            state.fail(message)
        }

        Input::Cancel { origin } => {
            if !status.accepts_cancel() {
                return (state, ignored(Some(origin)));
            }
            state.reset(false);
            vec![Effect::ReleaseResources]
        }

        Input::SetTitle(title) => {
            if !matches!(status, CaptureStatus::Idle | CaptureStatus::Error) {
                return (state, ignored(None));
            }
            let title = title.trim();
            state.title = if title.is_empty() {
                state.default_title.clone()
            } else {
                title.to_string()
            };
            Vec::new()
        }

        Input::Teardown => {
            state.reset(false);
            vec![Effect::ReleaseResources]
        }
    };

    (state, effects)
}
