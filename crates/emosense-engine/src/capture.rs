use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use emosense_contracts::events::EventWriter;
use emosense_contracts::wire::JPEG_DATA_URI_PREFIX;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;

/// JPEG quality for captured frames, on a 0-1 scale.
pub const JPEG_QUALITY: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Environment => "environment",
        }
    }
}

/// Preferences passed to the device when a stream is opened. Width and
/// height are ideals; devices may deliver something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: FacingMode,
    pub audio: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            facing: FacingMode::User,
            audio: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    PermissionDenied,
    DeviceNotFound,
    Device(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "camera permission denied"),
            Self::DeviceNotFound => write!(f, "no camera device found"),
            Self::Device(message) => write!(f, "camera error: {message}"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// A live video stream handed out by a [`VideoDevice`].
pub trait VideoStream: Send {
    /// The frame currently on display, without advancing the stream.
    fn current_frame(&self) -> Option<DynamicImage>;
    fn is_live(&self) -> bool;
    /// Releases the underlying hardware. Must tolerate repeated calls.
    fn stop(&mut self);
}

pub trait VideoDevice: Send {
    fn name(&self) -> &str;
    fn open(&mut self, constraints: &CaptureConstraints) -> Result<Box<dyn VideoStream>, CaptureError>;
}

/// One JPEG still, carried as a data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    data_uri: String,
    width: u32,
    height: u32,
}

impl CapturedFrame {
    pub fn from_data_uri(data_uri: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            data_uri: data_uri.into(),
            width,
            height,
        }
    }

    pub fn data_uri(&self) -> &str {
        &self.data_uri
    }

    pub fn into_data_uri(self) -> String {
        self.data_uri
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// What the orchestrator pulls frames from.
pub trait FrameSource: Send {
    fn start(&mut self, constraints: &CaptureConstraints) -> Result<(), CaptureError>;
    fn stop(&mut self);
    fn is_active(&self) -> bool;
    fn capture(&mut self) -> Option<CapturedFrame>;
}

/// Owns at most one stream from a [`VideoDevice`] and turns its current
/// frame into a JPEG still on demand.
pub struct FrameCapture {
    device: Box<dyn VideoDevice>,
    stream: Option<Box<dyn VideoStream>>,
    events: Option<EventWriter>,
    last_error: Option<CaptureError>,
}

impl FrameCapture {
    pub fn new(device: Box<dyn VideoDevice>) -> Self {
        Self {
            device,
            stream: None,
            events: None,
            last_error: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    /// Swaps the device. Any stream from the old device is released.
    pub fn replace_device(&mut self, device: Box<dyn VideoDevice>) {
        self.stop();
        self.device = device;
    }

    fn report_failure(&mut self, err: CaptureError) -> CaptureError {
        if let Some(events) = &self.events {
            events.emit_best_effort(
                "capture_failed",
                json!({
                    "device": self.device.name(),
                    "error": err.to_string(),
                }),
            );
        }
        self.last_error = Some(err.clone());
        err
    }
}

impl FrameSource for FrameCapture {
    fn start(&mut self, constraints: &CaptureConstraints) -> Result<(), CaptureError> {
        self.stop();
        let mut stream = match self.device.open(constraints) {
            Ok(stream) => stream,
            Err(err) => return Err(self.report_failure(err)),
        };
        if !stream.is_live() {
            stream.stop();
            return Err(self.report_failure(CaptureError::Device(
                "stream ended during acquisition".to_string(),
            )));
        }

        self.stream = Some(stream);
        self.last_error = None;
        if let Some(events) = &self.events {
            events.emit_best_effort(
                "capture_started",
                json!({
                    "device": self.device.name(),
                    "ideal_width": constraints.ideal_width,
                    "ideal_height": constraints.ideal_height,
                    "facing": constraints.facing.as_str(),
                }),
            );
        }
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        stream.stop();
        if let Some(events) = &self.events {
            events.emit_best_effort(
                "capture_stopped",
                json!({ "device": self.device.name() }),
            );
        }
    }

    fn is_active(&self) -> bool {
        self.stream
            .as_ref()
            .map(|stream| stream.is_live())
            .unwrap_or(false)
    }

    fn capture(&mut self) -> Option<CapturedFrame> {
        let stream = self.stream.as_ref().filter(|stream| stream.is_live())?;
        let frame = stream.current_frame()?;
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }
        match encode_jpeg_data_uri(&frame) {
            Ok(captured) => Some(captured),
            Err(err) => {
                if let Some(events) = &self.events {
                    events.emit_best_effort(
                        "capture_unavailable",
                        json!({ "reason": format!("{err:#}") }),
                    );
                }
                None
            }
        }
    }
}

impl Drop for FrameCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Renders `frame` onto an opaque RGB raster and encodes it as a JPEG data URI.
pub fn encode_jpeg_data_uri(frame: &DynamicImage) -> anyhow::Result<CapturedFrame> {
    let raster = flatten_onto_black(frame);
    let (width, height) = raster.dimensions();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, jpeg_quality_percent(JPEG_QUALITY));
    encoder.encode_image(&raster)?;
    Ok(CapturedFrame {
        data_uri: format!("{JPEG_DATA_URI_PREFIX}{}", BASE64.encode(bytes)),
        width,
        height,
    })
}

fn jpeg_quality_percent(quality: f32) -> u8 {
    (quality.clamp(0.0, 1.0) * 100.0).round() as u8
}

// A canvas starts out transparent black, so translucent pixels blend toward black.
fn flatten_onto_black(frame: &DynamicImage) -> RgbImage {
    let rgba = frame.to_rgba8();
    let mut raster = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 { ((u16::from(channel) * alpha) / 255) as u8 };
        raster.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    raster
}
