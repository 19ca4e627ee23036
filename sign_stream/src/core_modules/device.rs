// THEORY:
// The `device` module wraps a camera as an acquire/release resource. Whatever
// produces raw frames (a real camera driver, a synthetic pattern, a still image)
// sits behind the `CameraBackend` trait; `CameraDevice` adds the lifecycle rules
// on top of it:
//
// 1.  `acquire` is idempotent and reports failures as `DeviceError` values.
// 2.  `release` is always safe, even when nothing is held.
// 3.  `capture_snapshot` turns the current frame into the JPEG data URL the
//     detection service expects, or yields `None` when there is nothing usable
//     (not acquired, or the source has not reported its dimensions yet).

use super::scheduler::SnapshotSource;
use crate::error::DeviceError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, ImageError, RgbImage};
use std::path::PathBuf;
use tracing::{info, warn};

pub const DEFAULT_JPEG_QUALITY: u8 = 100;
const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

/// What we ask of the camera. Backends treat the sizes as preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: FacingMode,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            facing: FacingMode::User,
        }
    }
}

/// A source of raw RGB frames.
pub trait CameraBackend: Send + 'static {
    fn open(&mut self, constraints: &CaptureConstraints) -> Result<(), DeviceError>;

    fn close(&mut self);

    /// The frame currently on screen, if the source has produced one.
    fn current_frame(&mut self) -> Option<RgbImage>;
}

pub struct CameraDevice<B> {
    backend: B,
    constraints: CaptureConstraints,
    jpeg_quality: u8,
    held: bool,
}

impl<B: CameraBackend> CameraDevice<B> {
    pub fn new(backend: B, constraints: CaptureConstraints) -> Self {
        Self {
            backend,
            constraints,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            held: false,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn acquire(&mut self) -> Result<(), DeviceError> {
        if self.held {
            return Ok(());
        }
        self.backend.open(&self.constraints)?;
        self.held = true;
        info!(
            width = self.constraints.ideal_width,
            height = self.constraints.ideal_height,
            "camera acquired"
        );
        Ok(())
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.backend.close();
        self.held = false;
        info!("camera released");
    }

    /// Current frame as a JPEG data URL at its native size.
    pub fn capture_snapshot(&mut self) -> Option<String> {
        if !self.held {
            return None;
        }
        let frame = self.backend.current_frame()?;
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }
        match encode_data_url(&frame, self.jpeg_quality) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "snapshot encoding failed");
                None
            }
        }
    }
}

impl<B: CameraBackend> SnapshotSource for CameraDevice<B> {
    fn capture_snapshot(&mut self) -> Option<String> {
        CameraDevice::capture_snapshot(self)
    }
}

/// Encodes `frame` as `data:image/jpeg;base64,...`.
pub fn encode_data_url(frame: &RgbImage, quality: u8) -> Result<String, ImageError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(frame)?;
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(DATA_URL_PREFIX);
    STANDARD.encode_string(&jpeg, &mut url);
    Ok(url)
}

/// Synthetic camera producing a moving gradient.
#[derive(Debug, Default)]
pub struct TestPatternBackend {
    size: Option<(u32, u32)>,
    warmup_frames: u32,
    pending_warmup: u32,
    deny: bool,
    tick: u32,
    opens: u32,
}

impl TestPatternBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report no usable frame for the first `frames` reads after each open.
    pub fn with_warmup(mut self, frames: u32) -> Self {
        self.warmup_frames = frames;
        self
    }

    /// Refuse every `open`, like a user declining the permission prompt.
    pub fn denying(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn opens(&self) -> u32 {
        self.opens
    }
}

impl CameraBackend for TestPatternBackend {
    fn open(&mut self, constraints: &CaptureConstraints) -> Result<(), DeviceError> {
        if self.deny {
            return Err(DeviceError::PermissionDenied("test pattern configured to deny".into()));
        }
        self.opens += 1;
        self.size = Some((constraints.ideal_width, constraints.ideal_height));
        self.pending_warmup = self.warmup_frames;
        self.tick = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.size = None;
    }

    fn current_frame(&mut self) -> Option<RgbImage> {
        let (width, height) = self.size?;
        if self.pending_warmup > 0 {
            self.pending_warmup -= 1;
            return Some(RgbImage::new(0, 0));
        }
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);
        Some(ImageBuffer::from_fn(width, height, |x, y| {
            image::Rgb([
                (x.wrapping_add(tick) % 256) as u8,
                (y % 256) as u8,
                (tick.wrapping_mul(4) % 256) as u8,
            ])
        }))
    }
}

/// Serves one decoded image file as every frame.
#[derive(Debug)]
pub struct StillImageBackend {
    path: PathBuf,
    frame: Option<RgbImage>,
}

impl StillImageBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            frame: None,
        }
    }
}

impl CameraBackend for StillImageBackend {
    fn open(&mut self, _constraints: &CaptureConstraints) -> Result<(), DeviceError> {
        let decoded = image::open(&self.path).map_err(|e| match e {
            ImageError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                DeviceError::NotFound(self.path.display().to_string())
            }
            ImageError::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                DeviceError::PermissionDenied(self.path.display().to_string())
            }
            other => DeviceError::Hardware(other.to_string()),
        })?;
        self.frame = Some(decoded.to_rgb8());
        Ok(())
    }

    fn close(&mut self) {
        self.frame = None;
    }

    fn current_frame(&mut self) -> Option<RgbImage> {
        self.frame.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> CaptureConstraints {
        CaptureConstraints {
            ideal_width: 64,
            ideal_height: 48,
            ..Default::default()
        }
    }

    fn decode(url: &str) -> image::DynamicImage {
        let payload = url.strip_prefix(DATA_URL_PREFIX).expect("jpeg data url");
        let bytes = STANDARD.decode(payload).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn snapshot_is_a_jpeg_data_url_at_native_size() {
        let mut device = CameraDevice::new(TestPatternBackend::new(), small());
        device.acquire().unwrap();

        let url = device.capture_snapshot().unwrap();
        let decoded = decode(&url);
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn acquire_is_idempotent() {
        let mut device = CameraDevice::new(TestPatternBackend::new(), small());
        device.acquire().unwrap();
        device.acquire().unwrap();
        assert_eq!(device.backend().opens(), 1);
        assert!(device.is_held());
    }

    #[test]
    fn release_without_acquire_is_a_no_op() {
        let mut device = CameraDevice::new(TestPatternBackend::new(), small());
        device.release();
        device.release();
        assert!(!device.is_held());
    }

    #[test]
    fn no_snapshot_unless_held() {
        let mut device = CameraDevice::new(TestPatternBackend::new(), small());
        assert!(device.capture_snapshot().is_none());

        device.acquire().unwrap();
        assert!(device.capture_snapshot().is_some());

        device.release();
        assert!(device.capture_snapshot().is_none());
    }

    #[test]
    fn zero_dimension_frames_yield_nothing() {
        let mut device = CameraDevice::new(TestPatternBackend::new().with_warmup(2), small());
        device.acquire().unwrap();
        assert!(device.capture_snapshot().is_none());
        assert!(device.capture_snapshot().is_none());
        assert!(device.capture_snapshot().is_some());
    }

    #[test]
    fn denied_permission_is_returned_not_raised() {
        let mut device = CameraDevice::new(TestPatternBackend::new().denying(), small());
        let err = device.acquire().unwrap_err();
        assert!(matches!(err, DeviceError::PermissionDenied(_)));
        assert!(!device.is_held());
    }

    #[test]
    fn missing_still_image_is_not_found() {
        let mut device = CameraDevice::new(
            StillImageBackend::new("/definitely/not/here/frame.png"),
            CaptureConstraints::default(),
        );
        assert!(matches!(device.acquire(), Err(DeviceError::NotFound(_))));
    }

    #[test]
    fn still_image_is_served_until_released() {
        let path = std::env::temp_dir().join(format!("sign_stream_still_{}.png", std::process::id()));
        RgbImage::from_pixel(32, 24, image::Rgb([200, 10, 10])).save(&path).unwrap();

        let mut device = CameraDevice::new(StillImageBackend::new(&path), CaptureConstraints::default());
        device.acquire().unwrap();
        let decoded = decode(&device.capture_snapshot().unwrap());
        assert_eq!((decoded.width(), decoded.height()), (32, 24));

        device.release();
        assert!(device.capture_snapshot().is_none());
        let _ = std::fs::remove_file(path);
    }
}
