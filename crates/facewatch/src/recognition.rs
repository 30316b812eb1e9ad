//! Registration flow and the recognition tick.
//!
//! [`RecognitionLoop`] owns the media source, the embedding provider, the
//! render target and the gallery. Both registration and ticks take
//! `&mut self`, so they can never overlap.

use crate::engine::EngineError;
use crate::render::{RecognizedFace, RenderTarget};
use facewatch_core::{DistanceMetric, EmbeddingProvider, FaceGallery, FaceMatcher};
use facewatch_hw::MediaSource;
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

/// Matching parameters shared by every matcher the loop builds.
#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub threshold: f32,
    pub metric: DistanceMetric,
}

/// Idle until the first registration; Active from then on.
#[derive(Debug)]
pub enum LoopState {
    Idle,
    Active(FaceMatcher),
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing registered yet: no capture, no detection, no render.
    Idle,
    Rendered(Vec<RecognizedFace>),
}

/// Acknowledgment of a successful registration.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub id: Uuid,
    pub label: String,
    pub confidence: f32,
    pub gallery_size: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoopStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub faces_seen: u64,
    pub last_tick_ms: Option<u64>,
}

pub struct RecognitionLoop {
    source: Box<dyn MediaSource>,
    provider: Box<dyn EmbeddingProvider>,
    render: Box<dyn RenderTarget>,
    gallery: FaceGallery,
    state: LoopState,
    settings: MatchSettings,
    stats: LoopStats,
}

impl RecognitionLoop {
    pub fn new(
        source: Box<dyn MediaSource>,
        provider: Box<dyn EmbeddingProvider>,
        render: Box<dyn RenderTarget>,
        settings: MatchSettings,
    ) -> Self {
        Self {
            source,
            provider,
            render,
            gallery: FaceGallery::new(),
            state: LoopState::Idle,
            settings,
            stats: LoopStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, LoopState::Active(_))
    }

    pub fn gallery(&self) -> &FaceGallery {
        &self.gallery
    }

    pub fn settings(&self) -> MatchSettings {
        self.settings
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Register the most prominent face in the current frame under `label`.
    /// Surrounding whitespace is not part of the label.
    pub fn register(&mut self, label: &str) -> Result<Registration, EngineError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(EngineError::EmptyLabel);
        }

        let frame = self.source.capture_frame()?;
        let detection = self
            .provider
            .detect_single_face(&frame.image)?
            .ok_or(EngineError::NoFaceDetected)?;

        let entry_id = self.gallery.add(label, detection.embedding)?.id;

        let was_idle = !self.is_active();
        self.state = LoopState::Active(FaceMatcher::new(
            self.gallery.snapshot(),
            self.settings.threshold,
            self.settings.metric,
        ));
        if was_idle {
            tracing::info!("first face registered; recognition active");
        }

        tracing::info!(
            label,
            id = %entry_id,
            confidence = detection.bbox.confidence,
            gallery_size = self.gallery.len(),
            "face registered"
        );

        Ok(Registration {
            id: entry_id,
            label: label.to_string(),
            confidence: detection.bbox.confidence,
            gallery_size: self.gallery.len(),
        })
    }

    /// One recognition pass: capture, detect, match, render.
    pub fn tick(&mut self) -> Result<TickOutcome, EngineError> {
        let LoopState::Active(matcher) = &self.state else {
            self.stats.ticks_skipped += 1;
            tracing::trace!("no faces registered yet; skipping recognition");
            return Ok(TickOutcome::Idle);
        };

        let started = Instant::now();
        let frame = self.source.capture_frame()?;
        let detections = self.provider.detect_all_faces(&frame.image)?;

        let faces: Vec<RecognizedFace> = detections
            .into_iter()
            .map(|d| RecognizedFace {
                result: matcher.find_best_match(&d.embedding),
                bbox: d.bbox,
            })
            .collect();

        self.render.render(&frame, &faces)?;

        let elapsed = started.elapsed().as_millis() as u64;
        self.stats.ticks_run += 1;
        self.stats.faces_seen += faces.len() as u64;
        self.stats.last_tick_ms = Some(elapsed);
        tracing::debug!(seq = frame.sequence, faces = faces.len(), elapsed_ms = elapsed, "tick");

        Ok(TickOutcome::Rendered(faces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderError;
    use facewatch_core::{BoundingBox, Detection, Embedding, MatchLabel, ProviderError};
    use facewatch_hw::{CameraError, Frame};
    use image::{Rgb, RgbImage};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        captures: usize,
        detect_all: usize,
        detect_single: usize,
        renders: Vec<usize>,
    }

    type Shared = Rc<RefCell<Calls>>;

    struct FakeSource(Shared);

    impl MediaSource for FakeSource {
        fn capture_frame(&mut self) -> Result<Frame, CameraError> {
            self.0.borrow_mut().captures += 1;
            Ok(Frame::new(RgbImage::from_pixel(64, 48, Rgb([90, 90, 90])), 0))
        }

        fn resolution(&self) -> (u32, u32) {
            (64, 48)
        }
    }

    /// Returns the same faces for every frame; `faces` is shared so tests
    /// can change what the "camera" sees.
    struct FakeProvider {
        calls: Shared,
        faces: Rc<RefCell<Vec<Detection>>>,
    }

    impl EmbeddingProvider for FakeProvider {
        fn detect_all_faces(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>, ProviderError> {
            self.calls.borrow_mut().detect_all += 1;
            Ok(self.faces.borrow().clone())
        }

        fn detect_single_face(&mut self, _frame: &RgbImage) -> Result<Option<Detection>, ProviderError> {
            self.calls.borrow_mut().detect_single += 1;
            let faces = self.faces.borrow();
            Ok(faces
                .iter()
                .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence))
                .cloned())
        }
    }

    struct FakeRender(Shared);

    impl RenderTarget for FakeRender {
        fn render(&mut self, _frame: &Frame, faces: &[RecognizedFace]) -> Result<(), RenderError> {
            self.0.borrow_mut().renders.push(faces.len());
            Ok(())
        }
    }

    fn detection(x: f32, confidence: f32, embedding: &[f32]) -> Detection {
        Detection {
            bbox: BoundingBox {
                x, y: 0.0, width: 10.0, height: 10.0,
                confidence, landmarks: None,
            },
            embedding: Embedding::new(embedding.to_vec()),
        }
    }

    fn setup(faces: Vec<Detection>) -> (RecognitionLoop, Shared, Rc<RefCell<Vec<Detection>>>) {
        let calls: Shared = Rc::default();
        let faces = Rc::new(RefCell::new(faces));
        let recognition = RecognitionLoop::new(
            Box::new(FakeSource(calls.clone())),
            Box::new(FakeProvider { calls: calls.clone(), faces: faces.clone() }),
            Box::new(FakeRender(calls.clone())),
            MatchSettings { threshold: 0.6, metric: DistanceMetric::Euclidean },
        );
        (recognition, calls, faces)
    }

    #[test]
    fn test_idle_tick_does_nothing() {
        let (mut recognition, calls, _) = setup(vec![detection(0.0, 0.9, &[0.0, 0.0])]);
        for _ in 0..3 {
            assert!(matches!(recognition.tick().unwrap(), TickOutcome::Idle));
        }
        let calls = calls.borrow();
        assert_eq!(calls.captures, 0);
        assert_eq!(calls.detect_all + calls.detect_single, 0);
        assert!(calls.renders.is_empty());
        assert_eq!(recognition.stats().ticks_skipped, 3);
        assert!(!recognition.is_active());
    }

    #[test]
    fn test_register_then_recognize() {
        let (mut recognition, calls, faces) = setup(vec![detection(5.0, 0.9, &[0.0, 0.0])]);
        let reg = recognition.register("Bob").unwrap();
        assert_eq!(reg.label, "Bob");
        assert_eq!(reg.gallery_size, 1);
        assert!(recognition.is_active());

        // Bob plus a stranger far away in embedding space
        faces.borrow_mut().push(detection(30.0, 0.8, &[2.0, 0.0]));
        let TickOutcome::Rendered(seen) = recognition.tick().unwrap() else {
            panic!("expected an active tick");
        };
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].result.label, MatchLabel::Known("Bob".into()));
        assert_eq!(seen[0].result.distance, 0.0);
        assert_eq!(seen[1].result.label, MatchLabel::Unknown);
        assert!((seen[1].result.distance - 2.0).abs() < 1e-6);
        assert_eq!(calls.borrow().renders, vec![2]);
    }

    #[test]
    fn test_register_stores_only_most_prominent_face() {
        let (mut recognition, _, _) = setup(vec![
            detection(0.0, 0.7, &[1.0, 0.0]),
            detection(20.0, 0.95, &[0.0, 1.0]),
        ]);
        recognition.register("Carol").unwrap();

        let snapshot = recognition.gallery().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].embeddings.len(), 1);
        assert_eq!(snapshot[0].embeddings[0].values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_empty_label_aborts_before_capture() {
        let (mut recognition, calls, _) = setup(vec![detection(0.0, 0.9, &[0.0])]);
        for label in ["", "   "] {
            assert!(matches!(recognition.register(label), Err(EngineError::EmptyLabel)));
        }
        assert_eq!(calls.borrow().captures, 0);
        assert!(recognition.gallery().is_empty());
        assert!(!recognition.is_active());
    }

    #[test]
    fn test_no_face_aborts_registration() {
        let (mut recognition, calls, _) = setup(Vec::new());
        assert!(matches!(recognition.register("Dan"), Err(EngineError::NoFaceDetected)));
        assert_eq!(calls.borrow().detect_single, 1);
        assert!(recognition.gallery().is_empty());
        assert!(!recognition.is_active());
    }

    #[test]
    fn test_repeated_labels_grow_gallery() {
        let (mut recognition, _, _) = setup(vec![detection(0.0, 0.9, &[0.1, 0.1])]);
        for n in 1..=3 {
            assert_eq!(recognition.register("Eve").unwrap().gallery_size, n);
        }
        assert_eq!(recognition.gallery().len(), 3);
        assert_eq!(recognition.gallery().labels(), vec!["Eve"]);
    }

    #[test]
    fn test_label_whitespace_is_trimmed() {
        let (mut recognition, _, _) = setup(vec![detection(0.0, 0.9, &[0.0, 0.0])]);
        assert_eq!(recognition.register("  Bob  ").unwrap().label, "Bob");
        recognition.register("Bob").unwrap();
        assert_eq!(recognition.gallery().labels(), vec!["Bob"]);

        let TickOutcome::Rendered(seen) = recognition.tick().unwrap() else {
            panic!("expected an active tick");
        };
        assert_eq!(seen[0].result.label, MatchLabel::Known("Bob".into()));
    }

    #[test]
    fn test_matcher_rebuilt_after_each_registration() {
        let (mut recognition, _, faces) = setup(vec![detection(0.0, 0.9, &[0.0, 0.0])]);
        recognition.register("first").unwrap();

        *faces.borrow_mut() = vec![detection(0.0, 0.9, &[5.0, 5.0])];
        recognition.register("second").unwrap();

        let TickOutcome::Rendered(seen) = recognition.tick().unwrap() else {
            panic!("expected an active tick");
        };
        assert_eq!(seen[0].result.label.as_str(), "second");
    }

    #[test]
    fn test_active_tick_with_no_faces_still_redraws() {
        let (mut recognition, calls, faces) = setup(vec![detection(0.0, 0.9, &[0.0])]);
        recognition.register("Bob").unwrap();
        faces.borrow_mut().clear();
        let TickOutcome::Rendered(seen) = recognition.tick().unwrap() else {
            panic!("expected an active tick");
        };
        assert!(seen.is_empty());
        assert_eq!(calls.borrow().renders, vec![0]);
        assert_eq!(recognition.stats().ticks_run, 1);
    }
}
