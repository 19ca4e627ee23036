// THEORY:
// The `settings` module holds the user-tunable knobs of a live stream. Every
// value that travels to the detection service as a performance hint is a
// validated newtype, so the scheduler never has to re-check ranges on each tick.
//
// The frame rate governs the scheduler's period; the remaining fields are copied
// verbatim into each outbound frame message.

use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_FRAME_RATE: u32 = 1;
pub const MAX_FRAME_RATE: u32 = 30;
pub const DEFAULT_FRAME_RATE: u32 = 10;
pub const MIN_RESIZE_FACTOR: f64 = 0.2;
pub const MAX_RESIZE_FACTOR: f64 = 1.0;

/// Capture rate in frames per second, constrained to 1..=30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct FrameRate(u32);

impl FrameRate {
    pub fn new(fps: u32) -> Result<Self, SettingsError> {
        if (MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&fps) {
            Ok(Self(fps))
        } else {
            Err(SettingsError::FrameRate(fps))
        }
    }

    pub fn fps(self) -> u32 {
        self.0
    }

    /// Time between two scheduler ticks: `1000 / fps` milliseconds.
    pub fn period(self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.0))
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self(DEFAULT_FRAME_RATE)
    }
}

impl TryFrom<u32> for FrameRate {
    type Error = SettingsError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FrameRate> for u32 {
    fn from(value: FrameRate) -> Self {
        value.0
    }
}

/// Server-side downscale hint, constrained to 0.2..=1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ResizeFactor(f64);

impl ResizeFactor {
    pub fn new(factor: f64) -> Result<Self, SettingsError> {
        if (MIN_RESIZE_FACTOR..=MAX_RESIZE_FACTOR).contains(&factor) {
            Ok(Self(factor))
        } else {
            Err(SettingsError::ResizeFactor(factor))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for ResizeFactor {
    fn default() -> Self {
        Self(MAX_RESIZE_FACTOR)
    }
}

impl TryFrom<f64> for ResizeFactor {
    type Error = SettingsError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResizeFactor> for f64 {
    fn from(value: ResizeFactor) -> Self {
        value.0
    }
}

/// Model input resolution requested from the detection service.
/// Smaller sizes are faster, larger sizes more accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum InputSize {
    Px160,
    Px256,
    #[default]
    Px320,
    Px416,
    Px640,
}

impl InputSize {
    pub const ALL: [InputSize; 5] = [
        InputSize::Px160,
        InputSize::Px256,
        InputSize::Px320,
        InputSize::Px416,
        InputSize::Px640,
    ];

    pub fn pixels(self) -> u32 {
        match self {
            InputSize::Px160 => 160,
            InputSize::Px256 => 256,
            InputSize::Px320 => 320,
            InputSize::Px416 => 416,
            InputSize::Px640 => 640,
        }
    }
}

impl TryFrom<u32> for InputSize {
    type Error = SettingsError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        InputSize::ALL
            .into_iter()
            .find(|size| size.pixels() == value)
            .ok_or(SettingsError::InputSize(value))
    }
}

impl From<InputSize> for u32 {
    fn from(value: InputSize) -> Self {
        value.pixels()
    }
}

/// Everything the presentation layer can tune on a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    pub frame_rate: FrameRate,
    /// Ask the service for an annotated image with every result. Turning this
    /// off is the single biggest throughput win.
    pub return_image: bool,
    /// Advisory hint: the service may ignore intermediate frames under load.
    pub skip_frames: u32,
    pub resize_factor: ResizeFactor,
    pub input_size: InputSize,
}
