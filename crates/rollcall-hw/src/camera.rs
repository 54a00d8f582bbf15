//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use serde::Serialize;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
/// Fraction of near-black pixels above which a frame is skipped as dark.
pub const DARK_FRAME_PCT: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("no camera device found: {0}")]
    NoDevice(String),
    #[error("camera does not support the requested capture settings: {0}")]
    Unsupported(String),
    #[error("camera busy: {0}")]
    Busy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

impl CameraError {
    /// Short message suitable for showing to the person at the camera.
    pub fn user_message(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied(_) => {
                "Camera access was denied. Grant access to the video device and try again."
            }
            CameraError::NoDevice(_) => "No camera was found. Connect a camera or pick another device.",
            CameraError::Unsupported(_) => {
                "The selected camera does not support the required capture mode."
            }
            CameraError::Busy(_) => "The camera is in use by another application.",
            CameraError::CaptureFailed(_) => "Reading from the camera failed.",
        }
    }
}

/// Classify an error from opening a device node.
pub fn classify_open_error(device_path: &str, err: &io::Error) -> CameraError {
    let detail = format!("{device_path}: {err}");
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => return CameraError::PermissionDenied(detail),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            return CameraError::NoDevice(detail)
        }
        Some(libc::EBUSY) => return CameraError::Busy(detail),
        _ => {}
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(detail),
        io::ErrorKind::NotFound => CameraError::NoDevice(detail),
        _ => CameraError::CaptureFailed(detail),
    }
}

/// Anything that can hand out live RGB frames.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Capture up to `count` non-dark frames, trying at most `count * 3`.
    ///
    /// Returns the frames and the number of dark frames skipped.
    fn capture_burst(&mut self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        let mut frames = Vec::with_capacity(count);
        let mut dark = 0usize;
        for _ in 0..count * 3 {
            if frames.len() >= count {
                break;
            }
            let frame = self.capture()?;
            if frame.is_dark(DARK_FRAME_PCT) {
                dark += 1;
                continue;
            }
            frames.push(frame);
        }
        Ok((frames, dark))
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// Motion-JPEG, decoded per frame.
    Mjpeg,
    /// Native RGB24.
    Rgb24,
    /// 8-bit grayscale, replicated to RGB.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// V4L2 camera device handle. The device is released when the handle is dropped.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") at 640x480.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NoDevice(device_path.to_string()));
        }

        let device =
            Device::with_path(device_path).map_err(|e| classify_open_error(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| classify_open_error(device_path, &e))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::Unsupported(format!(
                "{device_path} is not a video capture device"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::Unsupported(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = DEFAULT_WIDTH;
        fmt.height = DEFAULT_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::Unsupported(format!("failed to set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::Unsupported(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, RGB3 or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture a single frame, converted to RGB.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;
        self.next_frame(&mut stream)
    }

    /// Capture up to `count` non-dark frames from one stream, trying at most
    /// `count * 3` buffers.
    ///
    /// Returns the frames and the number of dark frames skipped.
    pub fn capture_frames(&self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        let mut stream = self.stream()?;
        let mut frames = Vec::with_capacity(count);
        let mut dark = 0usize;

        for _ in 0..count * 3 {
            if frames.len() >= count {
                break;
            }
            let frame = self.next_frame(&mut stream)?;
            if frame.is_dark(DARK_FRAME_PCT) {
                dark += 1;
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }
            frames.push(frame);
        }

        Ok((frames, dark))
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
    }

    fn next_frame(&self, stream: &mut MmapStream<'_>) -> Result<Frame, CameraError> {
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let data = self.buf_to_rgb(buf)?;
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
            PixelFormat::Rgb24 => {
                let expected = (self.width * self.height * 3) as usize;
                if buf.len() < expected {
                    Err(frame::FrameError::InvalidLength {
                        expected,
                        actual: buf.len(),
                    })
                } else {
                    Ok(buf[..expected].to_vec())
                }
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn capture_burst(&mut self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        self.capture_frames(count)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "camera released");
    }
}
