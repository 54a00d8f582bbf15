//! rollcall-hw — Camera capture for the attendance scanner.
//!
//! Provides V4L2 camera access delivering RGB frames, device enumeration,
//! and classification of camera access failures.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat, DARK_FRAME_PCT};
pub use frame::Frame;
