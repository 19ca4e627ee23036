// THEORY:
// The `scheduler` module paces outbound traffic. One background task owns the
// only timer; it wakes at a monotonic deadline, grabs a snapshot, wraps it with
// the current performance hints and hands it to the sink. The deadline advances
// by exactly one period per tick (`deadline += period`), so a slow tick does not
// push every later tick back the way re-arming a fixed interval would.
//
// Control flows in through two watch channels, mirroring how the visualizer's
// play/pause handle works: a streaming flag and the current settings. Changing
// the frame rate re-arms the deadline inside the same task, so two timers can
// never be live at once. `stop()` waits for the task to finish, which guarantees
// no tick fires afterwards. A `HaltHandle` flips the same flag from another task
// without owning the scheduler; the loop exits before its next tick.

use super::connection::{ConnectionManager, SendStatus};
use super::transport::Connector;
use crate::protocol::OutboundFrameMessage;
use crate::settings::{FrameRate, StreamSettings};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace};

/// Produces the frame to send on a tick, already encoded for the wire.
pub trait SnapshotSource: Send + 'static {
    /// `None` while the video source has no usable dimensions.
    fn capture_snapshot(&mut self) -> Option<String>;
}

/// Where ticks deliver their frames.
pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, message: &OutboundFrameMessage) -> SendStatus;
}

impl<C: Connector> FrameSink for ConnectionManager<C> {
    fn send_frame(&self, message: &OutboundFrameMessage) -> SendStatus {
        self.send(message)
    }
}

/// Stops a scheduler's loop from elsewhere. Does not wait for it to exit.
#[derive(Clone)]
pub struct HaltHandle {
    streaming: watch::Sender<bool>,
}

impl HaltHandle {
    pub fn halt(&self) {
        self.streaming.send_replace(false);
    }
}

pub struct FrameScheduler {
    streaming: watch::Sender<bool>,
    settings: watch::Sender<StreamSettings>,
    task: JoinHandle<()>,
}

impl FrameScheduler {
    /// Spawns the capture loop. The first frame goes out one period from now.
    pub fn start<S, K>(source: Arc<Mutex<S>>, sink: K, settings: StreamSettings) -> Self
    where
        S: SnapshotSource,
        K: FrameSink,
    {
        let (streaming, streaming_rx) = watch::channel(true);
        let (settings_tx, settings_rx) = watch::channel(settings);
        let task = tokio::spawn(run_capture_loop(source, sink, streaming_rx, settings_rx));
        Self {
            streaming,
            settings: settings_tx,
            task,
        }
    }

    pub fn halt_handle(&self) -> HaltHandle {
        HaltHandle {
            streaming: self.streaming.clone(),
        }
    }

    pub fn settings(&self) -> StreamSettings {
        *self.settings.borrow()
    }

    pub fn set_frame_rate(&self, frame_rate: FrameRate) {
        self.settings.send_modify(|settings| settings.frame_rate = frame_rate);
    }

    pub fn update_settings(&self, settings: StreamSettings) {
        self.settings.send_replace(settings);
    }

    /// Stops the timer and waits for the loop to exit.
    pub async fn stop(self) {
        let _ = self.streaming.send(false);
        if let Err(e) = self.task.await {
            debug!(error = %e, "capture loop ended abnormally");
        }
    }
}

async fn run_capture_loop<S, K>(
    source: Arc<Mutex<S>>,
    sink: K,
    mut streaming: watch::Receiver<bool>,
    mut settings_rx: watch::Receiver<StreamSettings>,
) where
    S: SnapshotSource,
    K: FrameSink,
{
    let mut settings = *settings_rx.borrow_and_update();
    let mut period = settings.frame_rate.period();
    let mut deadline = Instant::now() + period;
    info!(fps = settings.frame_rate.fps(), "frame capture started");

    loop {
        tokio::select! {
            biased;

            changed = streaming.changed() => {
                if changed.is_err() || !*streaming.borrow_and_update() {
                    break;
                }
            }
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *settings_rx.borrow_and_update();
                if next.frame_rate != settings.frame_rate {
                    period = next.frame_rate.period();
                    deadline = Instant::now() + period;
                    debug!(fps = next.frame_rate.fps(), "frame rate changed, timer replaced");
                }
                settings = next;
            }
            _ = sleep_until(deadline) => {
                capture_and_send(&source, &sink, &settings);
                deadline += period;
                let now = Instant::now();
                if deadline <= now {
                    // More than a full period behind: skip the missed ticks.
                    deadline = now + period;
                }
            }
        }
    }

    info!("frame capture stopped");
}

fn capture_and_send<S: SnapshotSource, K: FrameSink>(source: &Mutex<S>, sink: &K, settings: &StreamSettings) {
    let snapshot = source
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .capture_snapshot();
    let Some(image) = snapshot else {
        trace!("video source has no usable dimensions yet");
        return;
    };
    let message = OutboundFrameMessage::new(image, unix_millis(), settings);
    if sink.send_frame(&message) == SendStatus::Dropped {
        debug!("frame dropped");
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
