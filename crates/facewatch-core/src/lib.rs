//! facewatch-core — face gallery, matching, and the embedding provider.
//!
//! The gallery and matcher are plain in-memory data structures. The stock
//! provider uses SCRFD for face detection and ArcFace for embeddings, both
//! running via ONNX Runtime on the CPU.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod onnx;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use detector::{DetectorOptions, FaceDetector};
pub use gallery::{FaceGallery, GalleryError, GallerySnapshot};
pub use matcher::{DistanceMetric, FaceMatcher, MatchLabel, MatchResult, DEFAULT_MATCH_THRESHOLD};
pub use onnx::{default_model_dir, OnnxProvider};
pub use provider::{EmbeddingProvider, ProviderError};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Detection, Embedding, LabeledEmbedding};
