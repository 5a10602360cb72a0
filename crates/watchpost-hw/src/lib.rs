//! watchpost-hw: video acquisition.
//!
//! A `FrameSource` abstraction with a V4L2 camera and a still-image
//! directory replay implementation, plus the pixel conversions and
//! smoothing the motion stage needs.

pub mod camera;
pub mod frame;
pub mod replay;
pub mod source;

pub use camera::{Camera, CameraError, CaptureSettings, PixelFormat};
pub use frame::Frame;
pub use replay::ReplaySource;
pub use source::{FrameSource, SourceError};
