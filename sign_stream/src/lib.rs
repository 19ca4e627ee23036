// THEORY:
// This file is the main entry point for the `sign_stream` library crate.
// It exposes the streaming/reconciliation engine that sits between a camera and
// a remote sign-language detection service.
//
// The primary export is the `StreamSession`, which owns one socket and one
// camera for the lifetime of a start/stop cycle and publishes reconciled
// detection lists as `SessionEvent`s. The building blocks (`core_modules`) are
// public so that presentation layers and tests can drive them individually:
// the connection manager, the frame-capture scheduler, the detection
// reconciler and the device lifecycle helper.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod upload;

pub use config::SessionConfig;
pub use core_modules::connection::{ConnectionEvent, ConnectionManager, ConnectionState, SendStatus};
pub use core_modules::device::{CameraBackend, CameraDevice, CaptureConstraints, StillImageBackend, TestPatternBackend};
pub use core_modules::reconciler::{DetectionReconciler, ReconcileUpdate};
pub use core_modules::scheduler::FrameScheduler;
pub use core_modules::transport::{Connector, WsConnector};
pub use error::{Error, Result};
pub use protocol::{Detection, DetectionPayload, FrameDetection, InboundResult, OutboundFrameMessage};
pub use session::{SessionEvent, StreamSession};
pub use settings::{FrameRate, InputSize, ResizeFactor, StreamSettings};
pub use upload::{UploadClient, UploadStatus};
