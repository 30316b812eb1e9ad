//! A media source that replays one still image, for demos without a webcam.

use crate::camera::CameraError;
use crate::frame::Frame;
use crate::source::MediaSource;
use image::RgbImage;
use std::path::Path;

pub struct StillImage {
    image: RgbImage,
    sequence: u32,
}

impl StillImage {
    /// Decode any format the `image` crate understands.
    pub fn open(path: &Path) -> Result<Self, CameraError> {
        if !path.exists() {
            return Err(CameraError::DeviceUnavailable(format!("{}: no such file", path.display())));
        }
        let image = image::open(path)?.to_rgb8();
        tracing::info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "opened still image source"
        );
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image, sequence: 0 }
    }
}

impl MediaSource for StillImage {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let frame = Frame::new(self.image.clone(), self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    fn resolution(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
