//! persona-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, RGB frame conversion, and the
//! capture controller that owns the device lifecycle.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat, V4l2Backend};
pub use capture::{CameraBackend, CaptureConstraints, CaptureController, FrameStream};
pub use frame::Frame;
