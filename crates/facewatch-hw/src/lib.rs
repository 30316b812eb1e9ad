//! facewatch-hw — Media sources for the recognition loop.
//!
//! Provides V4L2 webcam capture (YUYV/RGB → RGB frames) and a still-image
//! source, both behind the [`MediaSource`] trait.

pub mod camera;
pub mod frame;
pub mod source;
pub mod still;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::MediaSource;
pub use still::StillImage;
