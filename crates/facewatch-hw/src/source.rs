//! The media source seam.

use crate::camera::CameraError;
use crate::frame::Frame;

/// Anything that yields RGB frames: a webcam, a still image, a test fake.
pub trait MediaSource {
    /// Capture the current frame.
    fn capture_frame(&mut self) -> Result<Frame, CameraError>;

    /// Native frame size as (width, height).
    fn resolution(&self) -> (u32, u32);

    /// Capture and drop `count` frames while exposure settles. Returns how
    /// many of those captures failed.
    fn discard_frames(&mut self, count: usize) -> usize {
        let mut failed = 0;
        for attempt in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(attempt, error = %e, "warmup capture failed");
                failed += 1;
            }
        }
        failed
    }

    /// Block until the source delivers its first decodable frame.
    ///
    /// Dark frames count: a dim room is still a working camera. Exposure
    /// settling is the caller's warmup budget. Gives up after
    /// `max_attempts` failed captures.
    fn wait_ready(&mut self, max_attempts: usize) -> Result<Frame, CameraError> {
        let mut last_error = None;
        for attempt in 0..max_attempts {
            match self.capture_frame() {
                Ok(frame) => {
                    tracing::debug!(attempt, seq = frame.sequence, is_dark = frame.is_dark, "media source ready");
                    return Ok(frame);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "waiting for source: capture failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(CameraError::NotReady {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Fails `failing` captures, then yields frames of `pixel`.
    struct Flaky {
        failing: usize,
        pixel: Rgb<u8>,
        captured: usize,
    }

    impl Flaky {
        fn new(failing: usize, pixel: Rgb<u8>) -> Self {
            Self { failing, pixel, captured: 0 }
        }
    }

    impl MediaSource for Flaky {
        fn capture_frame(&mut self) -> Result<Frame, CameraError> {
            self.captured += 1;
            if self.captured <= self.failing {
                return Err(CameraError::CaptureFailed("select timeout".into()));
            }
            Ok(Frame::new(RgbImage::from_pixel(4, 4, self.pixel), self.captured as u32))
        }

        fn resolution(&self) -> (u32, u32) {
            (4, 4)
        }
    }

    #[test]
    fn test_wait_ready_skips_failed_captures() {
        let mut source = Flaky::new(3, Rgb([120, 120, 120]));
        let frame = source.wait_ready(10).unwrap();
        assert_eq!(frame.sequence, 4);
    }

    #[test]
    fn test_dim_frame_is_ready() {
        let mut source = Flaky::new(0, Rgb([20, 20, 20]));
        let frame = source.wait_ready(30).unwrap();
        assert!(frame.is_dark);
        assert_eq!(source.captured, 1);
    }

    #[test]
    fn test_discard_frames_counts_failures() {
        let mut source = Flaky::new(2, Rgb([120, 120, 120]));
        assert_eq!(source.discard_frames(4), 2);
        assert_eq!(source.captured, 4);
        assert_eq!(source.wait_ready(1).unwrap().sequence, 5);
    }

    #[test]
    fn test_wait_ready_gives_up() {
        let mut source = Flaky::new(100, Rgb([120, 120, 120]));
        let err = source.wait_ready(5).unwrap_err();
        assert!(matches!(
            err,
            CameraError::NotReady { attempts: 5, last_error: Some(_) }
        ));
        assert_eq!(source.captured, 5);
    }
}
