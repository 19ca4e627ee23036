// THEORY:
// The `session` module is the top-level API of the library. A `StreamSession`
// ties one camera, one socket and one reconciler together for the lifetime of a
// start/stop cycle and publishes what the presentation layer needs to show as a
// stream of `SessionEvent`s.
//
// Start order is device -> socket -> scheduler -> reconciliation pump, so the
// first tick always finds an open socket and a live camera. The pump subscribes
// before the socket opens and misses nothing. Stop runs the other way round: the
// scheduler goes first so no frame is captured against a closing socket, then
// the socket, then the camera. The reconciler lives inside the pump task, so
// stopping the pump drops its cache with it.
//
// A connection whose reconnect budget is exhausted ends the stream from inside
// the pump: it halts the scheduler and releases the camera itself, then reports
// the loss. The session is no longer streaming after that and `start()` begins a
// fresh cycle. A malformed payload is reported once through the same error
// channel but leaves the stream running. Frames dropped while reconnecting are
// only logged.

use crate::config::SessionConfig;
use crate::core_modules::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::core_modules::device::{CameraBackend, CameraDevice};
use crate::core_modules::reconciler::{DetectionReconciler, ReconcileUpdate};
use crate::core_modules::scheduler::{FrameScheduler, HaltHandle};
use crate::core_modules::transport::Connector;
use crate::error::SessionError;
use crate::protocol::Detection;
use crate::settings::{FrameRate, StreamSettings};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CAMERA_ERROR_MESSAGE: &str =
    "Failed to access webcam. Please ensure your camera is connected and permissions are granted.";
pub const CONNECT_ERROR_MESSAGE: &str = "Failed to connect to detection server. Please ensure the backend is running.";
pub const CONNECTION_LOST_MESSAGE: &str = "Connection to detection server failed. Please try again.";
pub const MALFORMED_RESULT_MESSAGE: &str = "Received an unreadable result from the detection server.";

const SESSION_EVENT_CAPACITY: usize = 64;

/// Everything the presentation layer is told.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The detection list to display now.
    Detections(Vec<Detection>),
    /// Annotated frame returned by the service, as a data URL.
    ProcessedImage(String),
    Sentence(String),
    /// A message meant for the user.
    Error(String),
    Connection(ConnectionState),
}

struct Streaming {
    scheduler: FrameScheduler,
    pump: JoinHandle<()>,
    stop_pump: oneshot::Sender<()>,
}

pub struct StreamSession<C: Connector, B: CameraBackend> {
    connection: ConnectionManager<C>,
    device: Arc<Mutex<CameraDevice<B>>>,
    events: broadcast::Sender<SessionEvent>,
    settings: StreamSettings,
    streaming: Option<Streaming>,
}

impl<C: Connector, B: CameraBackend> StreamSession<C, B> {
    pub fn new(config: &SessionConfig, connector: C, backend: B) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let device = CameraDevice::new(backend, config.constraints).with_jpeg_quality(config.jpeg_quality);
        Self {
            connection: ConnectionManager::new(connector, config.endpoint.clone()),
            device: Arc::new(Mutex::new(device)),
            events,
            settings: config.settings,
            streaming: None,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    /// False again once the connection has given up, even before `stop()`.
    pub fn is_streaming(&self) -> bool {
        self.streaming.as_ref().is_some_and(|streaming| !streaming.pump.is_finished())
    }

    pub fn is_device_held(&self) -> bool {
        self.lock_device().is_held()
    }

    pub fn settings(&self) -> StreamSettings {
        self.settings
    }

    /// Acquires the camera, connects and starts capturing. No-op while streaming.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Ok(());
        }
        // Collect what a stream that ended on its own left behind.
        self.stop().await;

        let acquired = self.lock_device().acquire();
        if let Err(e) = acquired {
            warn!(error = %e, "camera could not be acquired");
            self.publish(SessionEvent::Error(CAMERA_ERROR_MESSAGE.to_string()));
            return Err(e.into());
        }

        // Subscribe before connecting so the pump also sees Connecting/Connected.
        let updates = self.connection.subscribe();
        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "detection service unreachable");
            self.lock_device().release();
            self.publish(SessionEvent::Connection(self.connection.state()));
            self.publish(SessionEvent::Error(CONNECT_ERROR_MESSAGE.to_string()));
            return Err(e.into());
        }

        let scheduler = FrameScheduler::start(Arc::clone(&self.device), self.connection.clone(), self.settings);
        let teardown = Teardown {
            scheduler: scheduler.halt_handle(),
            device: Arc::clone(&self.device),
        };
        let (stop_pump, stopped) = oneshot::channel();
        let pump = tokio::spawn(run_reconcile_pump(updates, self.events.clone(), stopped, teardown));
        self.streaming = Some(Streaming {
            scheduler,
            pump,
            stop_pump,
        });
        info!(fps = self.settings.frame_rate.fps(), "stream started");
        Ok(())
    }

    /// Stops capturing, closes the socket and releases the camera, in that order.
    pub async fn stop(&mut self) {
        let Some(streaming) = self.streaming.take() else {
            return;
        };
        streaming.scheduler.stop().await;
        self.connection.disconnect();
        self.lock_device().release();

        let _ = streaming.stop_pump.send(());
        if let Err(e) = streaming.pump.await {
            debug!(error = %e, "reconcile pump ended abnormally");
        }
        info!("stream stopped");
    }

    pub fn set_frame_rate(&mut self, frame_rate: FrameRate) {
        self.settings.frame_rate = frame_rate;
        if let Some(streaming) = &self.streaming {
            streaming.scheduler.set_frame_rate(frame_rate);
        }
    }

    /// Applies to the next tick when streaming, and to the next start otherwise.
    pub fn update_settings(&mut self, settings: StreamSettings) {
        self.settings = settings;
        if let Some(streaming) = &self.streaming {
            streaming.scheduler.update_settings(settings);
        }
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn lock_device(&self) -> MutexGuard<'_, CameraDevice<B>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Connector, B: CameraBackend> Drop for StreamSession<C, B> {
    fn drop(&mut self) {
        // Dropping the scheduler and pump handles ends both tasks.
        if self.streaming.take().is_some() {
            self.connection.disconnect();
            self.lock_device().release();
        }
    }
}

/// What the pump shuts down by itself when the connection gives up.
struct Teardown<B: CameraBackend> {
    scheduler: HaltHandle,
    device: Arc<Mutex<CameraDevice<B>>>,
}

impl<B: CameraBackend> Teardown<B> {
    fn run(&self) {
        self.scheduler.halt();
        self.device.lock().unwrap_or_else(PoisonError::into_inner).release();
    }
}

async fn run_reconcile_pump<B: CameraBackend>(
    mut updates: broadcast::Receiver<ConnectionEvent>,
    events: broadcast::Sender<SessionEvent>,
    mut stop: oneshot::Receiver<()>,
    teardown: Teardown<B>,
) {
    let mut reconciler = DetectionReconciler::new();

    loop {
        tokio::select! {
            biased;

            update = updates.recv() => match update {
                Ok(ConnectionEvent::Message(result)) => publish_update(&events, reconciler.apply(&result)),
                Ok(ConnectionEvent::ProtocolError(e)) => {
                    debug!(error = %e, "skipping malformed result");
                    let _ = events.send(SessionEvent::Error(MALFORMED_RESULT_MESSAGE.to_string()));
                }
                Ok(ConnectionEvent::StateChanged(ConnectionState::Failed)) => {
                    teardown.run();
                    warn!("reconnect budget exhausted, stream ended");
                    let _ = events.send(SessionEvent::Connection(ConnectionState::Failed));
                    let _ = events.send(SessionEvent::Error(CONNECTION_LOST_MESSAGE.to_string()));
                    break;
                }
                Ok(ConnectionEvent::StateChanged(state)) => {
                    let _ = events.send(SessionEvent::Connection(state));
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "reconcile pump fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        }
    }

    debug!(cached = reconciler.cached().len(), "reconcile pump stopped");
}

fn publish_update(events: &broadcast::Sender<SessionEvent>, update: ReconcileUpdate) {
    if let Some(error) = update.error {
        let _ = events.send(SessionEvent::Error(error));
        return;
    }
    if let Some(detections) = update.detections {
        let _ = events.send(SessionEvent::Detections(detections));
    }
    if let Some(image) = update.image {
        let _ = events.send(SessionEvent::ProcessedImage(image));
    }
    if let Some(sentence) = update.sentence {
        let _ = events.send(SessionEvent::Sentence(sentence));
    }
}
