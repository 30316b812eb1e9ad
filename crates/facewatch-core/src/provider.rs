//! The embedding provider seam: anything that can find faces in an RGB
//! image and embed them.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::Detection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Face detection plus descriptor extraction.
///
/// Implementations are constructed fully initialized (models loaded), so a
/// detection call can never run ahead of model setup.
pub trait EmbeddingProvider {
    /// Every face in the frame, most confident first.
    fn detect_all_faces(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, ProviderError>;

    /// The single most prominent face, if any.
    fn detect_single_face(&mut self, frame: &RgbImage) -> Result<Option<Detection>, ProviderError> {
        let detections = self.detect_all_faces(frame)?;
        Ok(detections.into_iter().reduce(|best, d| {
            if d.bbox.confidence > best.bbox.confidence { d } else { best }
        }))
    }
}
