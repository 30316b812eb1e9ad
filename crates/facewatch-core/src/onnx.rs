//! The stock embedding provider: SCRFD detection + ArcFace embedding.

use crate::detector::{DetectorOptions, FaceDetector};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::recognizer::FaceRecognizer;
use crate::types::Detection;
use image::RgbImage;
use std::path::{Path, PathBuf};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Where models live unless configured otherwise:
/// `$XDG_DATA_HOME/facewatch/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch/models")
}

pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path, options: DetectorOptions) -> Result<Self, ProviderError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd.to_string_lossy(), options)?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;
        tracing::info!(dir = %model_dir.display(), "embedding provider ready");

        Ok(Self { detector, recognizer })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_all_faces(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, ProviderError> {
        let faces = self.detector.detect(frame)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = self.recognizer.extract(frame, &bbox)?;
            detections.push(Detection { bbox, embedding });
        }
        Ok(detections)
    }

    /// Embeds only the winning face instead of every face in frame.
    fn detect_single_face(&mut self, frame: &RgbImage) -> Result<Option<Detection>, ProviderError> {
        let faces = self.detector.detect(frame)?;
        let Some(bbox) = faces.into_iter().next() else {
            return Ok(None);
        };
        let embedding = self.recognizer.extract(frame, &bbox)?;
        Ok(Some(Detection { bbox, embedding }))
    }
}
