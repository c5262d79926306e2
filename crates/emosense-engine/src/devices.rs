use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::capture::{CaptureConstraints, CaptureError, VideoDevice, VideoStream};

const STILL_FRAME_INTERVAL: Duration = Duration::from_secs(1);

/// Stands in for a machine without a camera.
#[derive(Debug, Default)]
pub struct NoCameraDevice;

impl VideoDevice for NoCameraDevice {
    fn name(&self) -> &str {
        "none"
    }

    fn open(
        &mut self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn VideoStream>, CaptureError> {
        Err(CaptureError::DeviceNotFound)
    }
}

/// Plays a still image, or every image in a directory in name order, as a
/// video feed that moves to the next picture once per second.
#[derive(Debug, Clone)]
pub struct StillImageDevice {
    path: PathBuf,
    name: String,
}

impl StillImageDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("stills:{}", path.display());
        Self { path, name }
    }

    fn frame_paths(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let metadata = fs::metadata(&self.path).map_err(io_capture_error)?;
        if metadata.is_file() {
            return Ok(vec![self.path.clone()]);
        }
        let mut paths = fs::read_dir(&self.path)
            .map_err(io_capture_error)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect::<Vec<PathBuf>>();
        paths.sort();
        if paths.is_empty() {
            return Err(CaptureError::DeviceNotFound);
        }
        Ok(paths)
    }
}

impl VideoDevice for StillImageDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn VideoStream>, CaptureError> {
        if constraints.audio {
            return Err(CaptureError::Device(
                "audio tracks are not supported".to_string(),
            ));
        }
        let mut frames = Vec::new();
        for path in self.frame_paths()? {
            let bytes = fs::read(&path).map_err(io_capture_error)?;
            let image = image::load_from_memory(&bytes).map_err(|err| {
                CaptureError::Device(format!("failed to decode {}: {err}", path.display()))
            })?;
            frames.push(fit_to_constraints(image, constraints));
        }
        Ok(Box::new(StillImageStream {
            frames,
            opened_at: Instant::now(),
            live: true,
        }))
    }
}

struct StillImageStream {
    frames: Vec<DynamicImage>,
    opened_at: Instant,
    live: bool,
}

impl VideoStream for StillImageStream {
    fn current_frame(&self) -> Option<DynamicImage> {
        if !self.live || self.frames.is_empty() {
            return None;
        }
        let ticks = self.opened_at.elapsed().as_millis() / STILL_FRAME_INTERVAL.as_millis();
        let idx = (ticks % self.frames.len() as u128) as usize;
        self.frames.get(idx).cloned()
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn stop(&mut self) {
        self.live = false;
        self.frames.clear();
    }
}

/// Synthetic colour-bar feed at exactly the requested ideal size.
#[derive(Debug, Default)]
pub struct TestPatternDevice;

impl VideoDevice for TestPatternDevice {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(
        &mut self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn VideoStream>, CaptureError> {
        if constraints.audio {
            return Err(CaptureError::Device(
                "audio tracks are not supported".to_string(),
            ));
        }
        Ok(Box::new(TestPatternStream {
            frame: Some(color_bars(constraints.ideal_width, constraints.ideal_height)),
        }))
    }
}

struct TestPatternStream {
    frame: Option<DynamicImage>,
}

impl VideoStream for TestPatternStream {
    fn current_frame(&self) -> Option<DynamicImage> {
        self.frame.clone()
    }

    fn is_live(&self) -> bool {
        self.frame.is_some()
    }

    fn stop(&mut self) {
        self.frame = None;
    }
}

fn color_bars(width: u32, height: u32) -> DynamicImage {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];
    let mut image = RgbImage::new(width, height);
    let bar_width = (width / BARS.len() as u32).max(1);
    for (x, _, pixel) in image.enumerate_pixels_mut() {
        let idx = ((x / bar_width) as usize).min(BARS.len() - 1);
        *pixel = Rgb(BARS[idx]);
    }
    DynamicImage::ImageRgb8(image)
}

fn fit_to_constraints(image: DynamicImage, constraints: &CaptureConstraints) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width <= constraints.ideal_width && height <= constraints.ideal_height {
        return image;
    }
    image.resize(
        constraints.ideal_width.max(1),
        constraints.ideal_height.max(1),
        FilterType::Triangle,
    )
}

fn has_image_extension(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    matches!(
        ext.as_str(),
        "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp"
    )
}

fn io_capture_error(err: std::io::Error) -> CaptureError {
    match err.kind() {
        ErrorKind::NotFound => CaptureError::DeviceNotFound,
        ErrorKind::PermissionDenied => CaptureError::PermissionDenied,
        _ => CaptureError::Device(err.to_string()),
    }
}
