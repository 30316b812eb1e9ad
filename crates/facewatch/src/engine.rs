use crate::recognition::{LoopStats, RecognitionLoop, Registration, TickOutcome};
use crate::render::{RecognizedFace, RenderError};
use facewatch_core::{DistanceMetric, GalleryError, ProviderError};
use facewatch_hw::CameraError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    #[error("Please enter a name!")]
    EmptyLabel,
    #[error("No face detected, try again!")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Errors the user can fix and retry; everything else is a fault.
    pub fn is_user_warning(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyLabel
                | EngineError::NoFaceDetected
                | EngineError::Gallery(GalleryError::EmptyLabel)
        )
    }
}

/// Snapshot of engine state for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub state: &'static str,
    pub gallery_size: usize,
    pub labels: Vec<String>,
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub stats: LoopStats,
}

/// Messages sent from front-ends to the engine thread.
enum EngineRequest {
    Register {
        label: String,
        reply: oneshot::Sender<Result<Registration, EngineError>>,
    },
    Tick {
        reply: oneshot::Sender<Result<Option<Vec<RecognizedFace>>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Register the most prominent face currently in view under `label`.
    pub async fn register(&self, label: &str) -> Result<Registration, EngineError> {
        let label = label.to_string();
        self.request(|reply| EngineRequest::Register { label, reply }).await?
    }

    /// Run one recognition tick now. `None` while no face is registered.
    pub async fn tick(&self) -> Result<Option<Vec<RecognizedFace>>, EngineError> {
        self.request(|reply| EngineRequest::Tick { reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `build` runs on that thread and must open the media source and load the
/// models; its failure is returned here so startup fails fast. With
/// `interval` set the engine ticks on its own, sleeping `interval` after
/// each tick completes; with `None` it only ticks on request.
pub async fn spawn_engine<F>(build: F, interval: Option<Duration>) -> Result<EngineHandle, EngineError>
where
    F: FnOnce() -> Result<RecognitionLoop, EngineError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            let recognition = match build() {
                Ok(r) => {
                    let _ = ready_tx.send(Ok(()));
                    r
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!(?interval, "engine thread started");
            match interval {
                Some(interval) => run_timed(recognition, rx, interval),
                None => run_on_demand(recognition, rx),
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

/// Drain queued requests, tick once, sleep; repeat until every handle is gone.
///
/// The next tick is only scheduled after the previous one has finished, and
/// registrations run between ticks, never during one.
fn run_timed(mut recognition: RecognitionLoop, mut rx: mpsc::Receiver<EngineRequest>, interval: Duration) {
    loop {
        loop {
            match rx.try_recv() {
                Ok(req) => handle(&mut recognition, req),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if let Err(e) = recognition.tick() {
            tracing::warn!(error = %e, "recognition tick failed");
        }

        std::thread::sleep(interval);
    }
}

fn run_on_demand(mut recognition: RecognitionLoop, mut rx: mpsc::Receiver<EngineRequest>) {
    while let Some(req) = rx.blocking_recv() {
        handle(&mut recognition, req);
    }
}

fn handle(recognition: &mut RecognitionLoop, req: EngineRequest) {
    match req {
        EngineRequest::Register { label, reply } => {
            let result = recognition.register(&label);
            if let Err(e) = &result {
                tracing::debug!(label = %label, error = %e, "registration rejected");
            }
            let _ = reply.send(result);
        }
        EngineRequest::Tick { reply } => {
            let result = recognition.tick().map(|outcome| match outcome {
                TickOutcome::Idle => None,
                TickOutcome::Rendered(faces) => Some(faces),
            });
            let _ = reply.send(result);
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(status(recognition));
        }
    }
}

fn status(recognition: &RecognitionLoop) -> EngineStatus {
    let settings = recognition.settings();
    EngineStatus {
        version: env!("CARGO_PKG_VERSION"),
        state: if recognition.is_active() { "active" } else { "idle" },
        gallery_size: recognition.gallery().len(),
        labels: recognition.gallery().labels().into_iter().map(String::from).collect(),
        threshold: settings.threshold,
        metric: settings.metric,
        stats: recognition.stats(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::MatchSettings;
    use crate::render::Overlays;
    use facewatch_core::{BoundingBox, Detection, Embedding, EmbeddingProvider, MatchLabel};
    use facewatch_hw::StillImage;
    use image::{Rgb, RgbImage};

    /// Sees one face whose embedding is the mean red value of the frame.
    struct RednessProvider;

    impl EmbeddingProvider for RednessProvider {
        fn detect_all_faces(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, ProviderError> {
            let red = frame.pixels().map(|p| p.0[0] as f32).sum::<f32>()
                / (frame.width() * frame.height()).max(1) as f32;
            Ok(vec![Detection {
                bbox: BoundingBox {
                    x: 1.0, y: 1.0, width: 4.0, height: 4.0,
                    confidence: 0.9, landmarks: None,
                },
                embedding: Embedding::new(vec![red / 255.0]),
            }])
        }
    }

    fn build() -> Result<RecognitionLoop, EngineError> {
        Ok(RecognitionLoop::new(
            Box::new(StillImage::from_image(RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])))),
            Box::new(RednessProvider),
            Box::new(Overlays::new()),
            MatchSettings { threshold: 0.6, metric: DistanceMetric::Euclidean },
        ))
    }

    #[tokio::test]
    async fn test_on_demand_engine_flow() {
        let engine = spawn_engine(build, None).await.unwrap();

        assert!(engine.tick().await.unwrap().is_none());
        assert_eq!(engine.status().await.unwrap().state, "idle");

        let err = engine.register("  ").await.unwrap_err();
        assert!(err.is_user_warning());
        assert_eq!(err.to_string(), "Please enter a name!");

        let reg = engine.register("Ruby").await.unwrap();
        assert_eq!(reg.gallery_size, 1);

        let faces = engine.tick().await.unwrap().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].result.label, MatchLabel::Known("Ruby".into()));

        let status = engine.status().await.unwrap();
        assert_eq!(status.state, "active");
        assert_eq!(status.labels, vec!["Ruby".to_string()]);
        assert_eq!(status.stats.ticks_run, 1);
        assert_eq!(status.stats.ticks_skipped, 1);
    }

    #[tokio::test]
    async fn test_timed_engine_ticks_after_registration() {
        let engine = spawn_engine(build, Some(Duration::from_millis(5))).await.unwrap();
        engine.register("Ruby").await.unwrap();

        let mut ticks = 0;
        for _ in 0..200 {
            ticks = engine.status().await.unwrap().stats.ticks_run;
            if ticks >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ticks >= 2, "engine did not tick on its own");
    }

    #[tokio::test]
    async fn test_startup_failure_is_reported() {
        let result = spawn_engine(|| Err(EngineError::NoFaceDetected), None).await;
        assert!(matches!(result, Err(EngineError::NoFaceDetected)));
    }
}
