// THEORY:
// The `protocol` module defines the JSON wire format spoken with the detection
// service. Outbound, the client sends one `OutboundFrameMessage` per scheduler
// tick. Inbound, the service answers with an `InboundResult` whose `detections`
// field comes in three shapes: a single detection, a flat list (live frames and
// still images), or a list of per-frame results (pre-recorded video).
//
// The shape is decided exactly once, at deserialization, into the tagged
// `DetectionPayload` enum. Everything downstream pattern-matches on the variant
// instead of probing for fields again.

use crate::error::ProtocolError;
use crate::settings::StreamSettings;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One classified sign with its confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f64,
    /// Bounding box as `[x1, y1, x2, y2]` in source-image pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f64) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox: None,
        }
    }
}

/// The detections the service computed for one frame of an uploaded video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetection {
    pub frame_number: u64,
    /// Position of the frame in the video, in seconds.
    pub timestamp: f64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// The three observed shapes of the `detections` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DetectionPayload {
    Single(Detection),
    List(Vec<Detection>),
    Timed(Vec<FrameDetection>),
}

impl DetectionPayload {
    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Array(items) => {
                let timed = items
                    .first()
                    .and_then(Value::as_object)
                    .is_some_and(|first| first.contains_key("frame_number"));
                if timed {
                    serde_json::from_value(Value::Array(items)).map(DetectionPayload::Timed)
                } else {
                    serde_json::from_value(Value::Array(items)).map(DetectionPayload::List)
                }
            }
            other => serde_json::from_value(other).map(DetectionPayload::Single),
        }
    }
}

impl<'de> Deserialize<'de> for DetectionPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        DetectionPayload::from_value(value).map_err(D::Error::custom)
    }
}

/// What kind of media an upload result describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
}

/// A result message from the detection service, live or from an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundResult {
    /// Echo of the outbound timestamp (ms), when the service provides one.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub detections: Option<DetectionPayload>,
    /// Annotated frame as a data URL, only when `return_image` was requested.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub sentence: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<MediaKind>,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

impl InboundResult {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One captured frame plus the performance hints in effect when it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrameMessage {
    /// `data:image/jpeg;base64,...`
    pub image: String,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub return_image: bool,
    pub skip_frames: u32,
    pub resize_factor: f64,
    pub input_size: u32,
}

impl OutboundFrameMessage {
    pub fn new(image: String, timestamp: u64, settings: &StreamSettings) -> Self {
        Self {
            image,
            timestamp,
            return_image: settings.return_image,
            skip_frames: settings.skip_frames,
            resize_factor: settings.resize_factor.value(),
            input_size: settings.input_size.pixels(),
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of strings, bools and finite numbers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}
