// THEORY:
// The `config` module gathers everything a `StreamSession` needs to know before
// it starts: where the detection service lives, which hints to attach to frames,
// and how to encode them. Defaults match the service's local development setup.
//
// Overrides come from `SIGN_STREAM_*` environment variables. A value that does
// not parse or is out of range is logged and ignored, so a typo degrades to the
// default instead of refusing to start.

use crate::core_modules::device::{CaptureConstraints, DEFAULT_JPEG_QUALITY};
use crate::settings::{FrameRate, InputSize, ResizeFactor, StreamSettings};
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/v1/detections/stream";
pub const DEFAULT_UPLOAD_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Socket endpoint of the live detection stream.
    pub endpoint: String,
    /// Base URL of the REST service used for uploads.
    pub upload_base_url: String,
    pub settings: StreamSettings,
    pub jpeg_quality: u8,
    pub constraints: CaptureConstraints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            upload_base_url: DEFAULT_UPLOAD_BASE_URL.to_string(),
            settings: StreamSettings::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            constraints: CaptureConstraints::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `SIGN_STREAM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGN_STREAM_URL") {
            config.endpoint = url;
        }
        if let Some(url) = lookup("SIGN_STREAM_UPLOAD_URL") {
            config.upload_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(rate) = parsed::<u32>(&lookup, "SIGN_STREAM_FPS").and_then(|fps| accept("SIGN_STREAM_FPS", FrameRate::new(fps))) {
            config.settings.frame_rate = rate;
        }
        if let Some(flag) = lookup("SIGN_STREAM_RETURN_IMAGE") {
            match parse_flag(&flag) {
                Some(value) => config.settings.return_image = value,
                None => warn!(key = "SIGN_STREAM_RETURN_IMAGE", value = %flag, "ignoring invalid setting"),
            }
        }
        if let Some(skip) = parsed::<u32>(&lookup, "SIGN_STREAM_SKIP_FRAMES") {
            config.settings.skip_frames = skip;
        }
        if let Some(factor) =
            parsed::<f64>(&lookup, "SIGN_STREAM_RESIZE").and_then(|f| accept("SIGN_STREAM_RESIZE", ResizeFactor::new(f)))
        {
            config.settings.resize_factor = factor;
        }
        if let Some(size) =
            parsed::<u32>(&lookup, "SIGN_STREAM_INPUT_SIZE").and_then(|px| accept("SIGN_STREAM_INPUT_SIZE", InputSize::try_from(px)))
        {
            config.settings.input_size = size;
        }
        if let Some(quality) = parsed::<u8>(&lookup, "SIGN_STREAM_JPEG_QUALITY") {
            if (1..=100).contains(&quality) {
                config.jpeg_quality = quality;
            } else {
                warn!(key = "SIGN_STREAM_JPEG_QUALITY", value = quality, "ignoring invalid setting");
            }
        }

        config
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn accept<T, E: std::fmt::Display>(key: &str, value: Result<T, E>) -> Option<T> {
    value.map_err(|e| warn!(key, error = %e, "ignoring invalid setting")).ok()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_point_at_local_service() {
        let config = SessionConfig::from_lookup(lookup(&[]));
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.endpoint, "ws://localhost:8000/v1/detections/stream");
        assert_eq!(config.settings.frame_rate.fps(), 10);
        assert_eq!(config.settings.input_size, InputSize::Px320);
        assert_eq!(config.jpeg_quality, 100);
    }

    #[test]
    fn valid_overrides_apply() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("SIGN_STREAM_URL", "ws://detector:9000/v1/detections/stream"),
            ("SIGN_STREAM_UPLOAD_URL", "http://detector:9000/"),
            ("SIGN_STREAM_FPS", "24"),
            ("SIGN_STREAM_RETURN_IMAGE", "true"),
            ("SIGN_STREAM_SKIP_FRAMES", "2"),
            ("SIGN_STREAM_RESIZE", "0.5"),
            ("SIGN_STREAM_INPUT_SIZE", "640"),
            ("SIGN_STREAM_JPEG_QUALITY", "80"),
        ]));
        assert_eq!(config.endpoint, "ws://detector:9000/v1/detections/stream");
        assert_eq!(config.upload_base_url, "http://detector:9000");
        assert_eq!(config.settings.frame_rate.fps(), 24);
        assert!(config.settings.return_image);
        assert_eq!(config.settings.skip_frames, 2);
        assert_eq!(config.settings.resize_factor.value(), 0.5);
        assert_eq!(config.settings.input_size, InputSize::Px640);
        assert_eq!(config.jpeg_quality, 80);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("SIGN_STREAM_FPS", "60"),
            ("SIGN_STREAM_RETURN_IMAGE", "maybe"),
            ("SIGN_STREAM_SKIP_FRAMES", "-1"),
            ("SIGN_STREAM_RESIZE", "0.1"),
            ("SIGN_STREAM_INPUT_SIZE", "300"),
            ("SIGN_STREAM_JPEG_QUALITY", "0"),
        ]));
        assert_eq!(config, SessionConfig::default());
    }
}
