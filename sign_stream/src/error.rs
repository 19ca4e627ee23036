// THEORY:
// The `error` module is the failure taxonomy of the streaming engine. Each
// concern (socket, wire format, camera, settings, upload) gets its own enum so
// callers can match on the failure kind that matters to them. `Error` unifies
// them for code that does not care which layer gave up.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// The socket failed to open, or a connect attempt was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open socket to {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },

    #[error("connect attempt superseded by a newer connect or disconnect")]
    Superseded,
}

/// An inbound payload did not have the expected structure.
#[derive(Debug, thiserror::Error)]
#[error("malformed inbound payload: {0}")]
pub struct ProtocolError(#[from] pub serde_json::Error);

/// Camera acquisition failed. Returned as a value, never raised as a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("no camera available: {0}")]
    NotFound(String),

    #[error("camera failure: {0}")]
    Hardware(String),
}

/// A user-supplied setting was outside its allowed range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("frame rate {0} fps is outside 1..=30")]
    FrameRate(u32),

    #[error("resize factor {0} is outside 0.2..=1.0")]
    ResizeFactor(f64),

    #[error("input size {0} is not one of 160, 256, 320, 416, 640")]
    InputSize(u32),
}

/// The upload endpoint for pre-recorded media failed.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by `StreamSession::start`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Crate-wide error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Error string reported by the remote detection service.
    #[error("detection service error: {0}")]
    Application(String),
}
