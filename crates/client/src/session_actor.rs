//! Capture session actor: owns the capture state and its resources.
//!
//! Local actions, device callbacks, ticks, upload results and the inbox
//! wake-up all arrive on one task, so every transition is applied in order.
//! Readers get a lock-free snapshot through `ArcSwap` and a broadcast stream
//! of [`CaptureEvent`]s. Internal tasks hold weak senders only, so dropping
//! the last handle stops the actor.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use capture_relay_protocol::{CaptureAction, CommandEnvelope};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{ActiveCapture, CaptureDevice, ChunkSink, SinkEvent};
use crate::error::DeviceError;
use crate::inbox::CommandInbox;
use crate::transition::{transition, CaptureState, CaptureStatus, Effect, Input, Origin};
use crate::upload::{UploadReceipt, UploadRequest, Uploader};

#[derive(Debug, Clone)]
pub struct CaptureSessionConfig {
    /// Sent with every upload.
    pub user_id: String,
    pub default_title: String,
    pub tick_period: Duration,
}

impl Default for CaptureSessionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            default_title: "New Audio Note".to_string(),
            tick_period: Duration::from_secs(1),
        }
    }
}

impl CaptureSessionConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    StatusChanged { status: CaptureStatus },
    Completed { artifact: String },
    Failed { message: String },
}

pub(crate) enum ActorMessage {
    Start,
    Stop,
    Cancel,
    SetTitle(String),
    DeviceGranted {
        attempt: u64,
        capture: Box<dyn ActiveCapture>,
    },
    DeviceDenied {
        attempt: u64,
        error: DeviceError,
    },
    Tick {
        attempt: u64,
    },
    UploadFinished {
        attempt: u64,
        result: Result<UploadReceipt, String>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running capture session (cheap to Clone).
#[derive(Clone)]
pub struct CaptureSessionHandle {
    command_tx: mpsc::Sender<ActorMessage>,
    snapshot: Arc<ArcSwap<CaptureState>>,
    events: broadcast::Sender<CaptureEvent>,
}

impl CaptureSessionHandle {
    pub fn spawn(
        config: CaptureSessionConfig,
        device: Arc<dyn CaptureDevice>,
        uploader: Arc<dyn Uploader>,
        inbox: Arc<CommandInbox>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(64);
        let state = CaptureState::new(config.default_title.clone());
        let snapshot = Arc::new(ArcSwap::from_pointee(state.clone()));

        let session = CaptureSession {
            state,
            config,
            device,
            uploader,
            resources: Resources::default(),
            pending_device: None,
            self_tx: command_tx.downgrade(),
            snapshot: snapshot.clone(),
            events: events.clone(),
        };
        tokio::spawn(session.run(command_rx, inbox));

        Self {
            command_tx,
            snapshot,
            events,
        }
    }

    pub async fn start(&self) {
        self.send(ActorMessage::Start).await;
    }

    pub async fn stop(&self) {
        self.send(ActorMessage::Stop).await;
    }

    pub async fn cancel(&self) {
        self.send(ActorMessage::Cancel).await;
    }

    pub async fn set_title(&self, title: impl Into<String>) {
        self.send(ActorMessage::SetTitle(title.into())).await;
    }

    /// Release everything and stop the actor. Resolves once cleanup is done.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        self.send(ActorMessage::Shutdown { reply }).await;
        let _ = done.await;
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<CaptureState> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    async fn send(&self, msg: ActorMessage) {
        if self.command_tx.send(msg).await.is_err() {
            warn!(
                component = "capture_session",
                event = "capture.actor.closed",
                "Actor channel closed, action dropped"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Resources held on behalf of the current attempt
// ---------------------------------------------------------------------------

/// Receiving end of the current attempt's [`ChunkSink`].
struct AttemptSink {
    attempt: u64,
    rx: mpsc::UnboundedReceiver<SinkEvent>,
}

#[derive(Default)]
struct Resources {
    acquire: Option<JoinHandle<()>>,
    device: Option<Box<dyn ActiveCapture>>,
    sink: Option<AttemptSink>,
    ticker: Option<JoinHandle<()>>,
    chunks: Vec<Bytes>,
    upload: Option<JoinHandle<()>>,
}

impl Resources {
    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    /// Stop and release the device, returning everything it produced.
    fn finish_device(&mut self) -> Bytes {
        let last = self.device.take().and_then(|mut device| {
            let last = device.stop();
            device.release();
            last
        });
        // Chunks queued before the stop come ahead of the final one.
        if let Some(mut sink) = self.sink.take() {
            while let Ok(event) = sink.rx.try_recv() {
                match event {
                    SinkEvent::Chunk(data) => self.chunks.push(data),
                    SinkEvent::Failed(error) => debug!(
                        component = "capture_session",
                        event = "capture.device.late_failure",
                        attempt = sink.attempt,
                        error = %error,
                        "Device failure reported after stop"
                    ),
                }
            }
        }
        self.chunks.extend(last);
        let mut payload = BytesMut::new();
        for chunk in self.chunks.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        payload.freeze()
    }

    /// Idempotent.
    fn release(&mut self) {
        self.stop_ticker();
        if let Some(acquire) = self.acquire.take() {
            acquire.abort();
        }
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
        if let Some(mut device) = self.device.take() {
            let _ = device.stop();
            device.release();
        }
        self.sink = None;
        self.chunks.clear();
    }

    fn is_idle(&self) -> bool {
        self.acquire.is_none()
            && self.device.is_none()
            && self.sink.is_none()
            && self.ticker.is_none()
            && self.upload.is_none()
            && self.chunks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct CaptureSession {
    state: CaptureState,
    config: CaptureSessionConfig,
    device: Arc<dyn CaptureDevice>,
    uploader: Arc<dyn Uploader>,
    resources: Resources,
    /// A freshly granted device waiting for the transition to adopt it.
    pending_device: Option<Box<dyn ActiveCapture>>,
    self_tx: mpsc::WeakSender<ActorMessage>,
    snapshot: Arc<ArcSwap<CaptureState>>,
    events: broadcast::Sender<CaptureEvent>,
}

impl CaptureSession {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ActorMessage>, inbox: Arc<CommandInbox>) {
        loop {
            tokio::select! {
                msg = command_rx.recv() => match msg {
                    Some(ActorMessage::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                _ = inbox.wait() => {
                    if let Some(command) = inbox.consume() {
                        self.handle_remote(command);
                    }
                }
                (attempt, event) = next_sink_event(&mut self.resources.sink) => {
                    self.handle_sink_event(attempt, event);
                }
            }
        }
        // Every other exit path is covered by Drop.
        debug!(
            component = "capture_session",
            event = "capture.actor.stopped",
            "Capture session actor stopped"
        );
    }

    fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Start => self.apply(Input::Start {
                suggested_title: None,
                linked_entity_id: None,
                origin: Origin::Local,
            }),
            ActorMessage::Stop => self.apply(Input::Stop {
                origin: Origin::Local,
            }),
            ActorMessage::Cancel => self.apply(Input::Cancel {
                origin: Origin::Local,
            }),
            ActorMessage::SetTitle(title) => self.apply(Input::SetTitle(title)),
            ActorMessage::DeviceGranted { attempt, capture } => {
                if attempt == self.state.attempt {
                    self.resources.acquire = None;
                }
                self.pending_device = Some(capture);
                self.apply(Input::PermissionGranted { attempt });
                if let Some(mut stale) = self.pending_device.take() {
                    info!(
                        component = "capture_session",
                        event = "capture.device.stale_grant",
                        attempt,
                        "Releasing device granted to an abandoned attempt"
                    );
                    let _ = stale.stop();
                    stale.release();
                }
            }
            ActorMessage::DeviceDenied { attempt, error } => {
                if attempt == self.state.attempt {
                    self.resources.acquire = None;
                }
                self.apply(Input::PermissionDenied { attempt, error });
            }
            ActorMessage::Tick { attempt } => self.apply(Input::Tick { attempt }),
            ActorMessage::UploadFinished { attempt, result } => {
                if attempt == self.state.attempt {
                    self.resources.upload = None;
                }
                match result {
                    Ok(receipt) => self.apply(Input::UploadSucceeded {
                        attempt,
                        artifact: receipt.artifact,
                    }),
                    Err(message) => self.apply(Input::UploadFailed { attempt, message }),
                }
            }
            ActorMessage::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn handle_sink_event(&mut self, attempt: u64, event: Option<SinkEvent>) {
        match event {
            Some(SinkEvent::Chunk(data)) => self.resources.chunks.push(data),
            Some(SinkEvent::Failed(error)) => self.apply(Input::DeviceFailed { attempt, error }),
            // Every sender is gone; the queue is already drained.
            None => self.resources.sink = None,
        }
    }

    fn handle_remote(&mut self, command: CommandEnvelope) {
        info!(
            component = "capture_session",
            event = "capture.remote.received",
            command_id = %command.command_id,
            action = %command.action,
            status = %self.state.status,
            "Applying remote command"
        );
        let origin = Origin::Remote {
            command_id: command.command_id.clone(),
        };
        let input = match command.action {
            CaptureAction::Start => Input::Start {
                suggested_title: command.suggested_title().map(str::to_string),
                linked_entity_id: command.linked_entity_id().map(str::to_string),
                origin,
            },
            CaptureAction::Stop => Input::Stop { origin },
            CaptureAction::Cancel => Input::Cancel { origin },
        };
        self.apply(input);
    }

    fn apply(&mut self, input: Input) {
        let previous = self.state.status;
        let current = std::mem::replace(&mut self.state, CaptureState::new(""));
        let (next, effects) = transition(current, input);
        self.state = next;

        for effect in effects {
            self.execute(effect);
        }

        self.publish(previous);
    }

    fn publish(&mut self, previous: CaptureStatus) {
        self.snapshot.store(Arc::new(self.state.clone()));
        if self.state.status != previous {
            debug!(
                component = "capture_session",
                event = "capture.status.changed",
                from = %previous,
                to = %self.state.status,
                attempt = self.state.attempt,
                "Capture status changed"
            );
            let _ = self.events.send(CaptureEvent::StatusChanged {
                status: self.state.status,
            });
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::RequestDevice { attempt } => self.request_device(attempt),
            Effect::AdoptDevice { .. } => {
                self.resources.device = self.pending_device.take();
            }
            Effect::StartTicker { attempt } => self.start_ticker(attempt),
            Effect::FinishCapture { attempt } => {
                self.resources.stop_ticker();
                let payload = self.resources.finish_device();
                // Still Stopped here; the follow-up input decides upload vs error.
                let (next, effects) = transition(
                    std::mem::replace(&mut self.state, CaptureState::new("")),
                    Input::CaptureFinished { attempt, payload },
                );
                self.state = next;
                for effect in effects {
                    self.execute(effect);
                }
            }
            Effect::Upload {
                attempt,
                payload,
                title,
                linked_entity_id,
            } => self.start_upload(
                attempt,
                UploadRequest {
                    payload,
                    title,
                    user_id: self.config.user_id.clone(),
                    linked_entity_id,
                },
            ),
            Effect::ReleaseResources => self.release_resources(),
            Effect::Completed { artifact } => {
                info!(
                    component = "capture_session",
                    event = "capture.completed",
                    artifact = %artifact,
                    "Capture uploaded"
                );
                let _ = self.events.send(CaptureEvent::Completed { artifact });
            }
            Effect::Failed { message } => {
                warn!(
                    component = "capture_session",
                    event = "capture.failed",
                    error = %message,
                    "Capture failed"
                );
                let _ = self.events.send(CaptureEvent::Failed { message });
            }
            Effect::Ignored {
                input,
                status,
                origin,
            } => match origin {
                Some(Origin::Remote { command_id }) => info!(
                    component = "capture_session",
                    event = "capture.remote.discarded",
                    command_id = %command_id,
                    input,
                    status = %status,
                    "Remote command does not apply in current state"
                ),
                Some(Origin::Local) => debug!(
                    component = "capture_session",
                    event = "capture.local.ignored",
                    input,
                    status = %status,
                    "Action does not apply in current state"
                ),
                None => debug!(
                    component = "capture_session",
                    event = "capture.stale.discarded",
                    input,
                    status = %status,
                    "Discarding stale result"
                ),
            },
        }
    }

    fn request_device(&mut self, attempt: u64) {
        let device = self.device.clone();
        let tx = self.self_tx.clone();
        let (sink, rx) = ChunkSink::channel(attempt);
        self.resources.sink = Some(AttemptSink { attempt, rx });
        self.resources.acquire = Some(tokio::spawn(async move {
            let result = device.acquire(sink).await;
            let Some(tx) = tx.upgrade() else {
                if let Ok(mut capture) = result {
                    capture.release();
                }
                return;
            };
            let msg = match result {
                Ok(capture) => ActorMessage::DeviceGranted { attempt, capture },
                Err(error) => ActorMessage::DeviceDenied { attempt, error },
            };
            if let Err(mpsc::error::SendError(msg)) = tx.send(msg).await {
                if let ActorMessage::DeviceGranted { mut capture, .. } = msg {
                    capture.release();
                }
            }
        }));
    }

    fn start_ticker(&mut self, attempt: u64) {
        self.resources.stop_ticker();
        let tx = self.self_tx.clone();
        let period = self.config.tick_period;
        self.resources.ticker = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let Some(tx) = tx.upgrade() else { break };
                if tx.send(ActorMessage::Tick { attempt }).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn start_upload(&mut self, attempt: u64, request: UploadRequest) {
        let uploader = self.uploader.clone();
        let tx = self.self_tx.clone();
        info!(
            component = "capture_session",
            event = "capture.upload.started",
            attempt,
            payload_bytes = request.payload.len(),
            title = %request.title,
            "Handing capture to uploader"
        );
        self.resources.upload = Some(tokio::spawn(async move {
            let result = uploader.upload(request).await.map_err(|e| {
                debug!(
                    component = "capture_session",
                    event = "capture.upload.error",
                    attempt,
                    error = %e,
                    "Uploader returned an error"
                );
                e.reason()
            });
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(ActorMessage::UploadFinished { attempt, result }).await;
            }
        }));
    }

    fn release_resources(&mut self) {
        self.resources.release();
        if let Some(mut device) = self.pending_device.take() {
            device.release();
        }
    }

    fn teardown(&mut self) {
        self.apply(Input::Teardown);
    }
}

/// Next event from the current attempt's sink; pending while there is none.
async fn next_sink_event(sink: &mut Option<AttemptSink>) -> (u64, Option<SinkEvent>) {
    match sink {
        Some(sink) => (sink.attempt, sink.rx.recv().await),
        None => std::future::pending().await,
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.resources.is_idle() || self.state.status != CaptureStatus::Idle {
            self.teardown();
        }
    }
}
