use facewatch_core::{DetectorOptions, DistanceMetric, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration.
///
/// Layered: built-in defaults, then a TOML file (`--config` or
/// `FACEWATCH_CONFIG`), then `FACEWATCH_*` environment variables. CLI flags
/// are applied last by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture size; the driver may negotiate another.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Distance below which a face is attributed to a registered label.
    pub match_threshold: f32,
    pub metric: DistanceMetric,
    /// Pause between the end of one recognition tick and the next.
    pub tick_interval_ms: u64,
    /// Frames discarded at startup while auto-exposure settles.
    pub warmup_frames: usize,
    /// Captures to attempt before declaring the camera not ready.
    pub ready_attempts: usize,
    pub detector_score_threshold: f32,
    /// Overlay surface size; defaults to the frame size.
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
    /// Where to write the overlay PNG each tick (disabled when unset).
    pub overlay_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: facewatch_core::default_model_dir(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            metric: DistanceMetric::Euclidean,
            tick_interval_ms: 100,
            warmup_frames: 4,
            ready_attempts: 30,
            detector_score_threshold: DetectorOptions::default().score_threshold,
            display_width: None,
            display_height: None,
            overlay_path: None,
        }
    }
}

impl Config {
    /// Defaults → optional TOML file → environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("FACEWATCH_CONFIG").ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Override fields from `FACEWATCH_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEWATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_OVERLAY_PATH") {
            self.overlay_path = Some(PathBuf::from(v));
        }
        env_parse(&lookup, "FACEWATCH_CAPTURE_WIDTH", &mut self.capture_width);
        env_parse(&lookup, "FACEWATCH_CAPTURE_HEIGHT", &mut self.capture_height);
        env_parse(&lookup, "FACEWATCH_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parse(&lookup, "FACEWATCH_METRIC", &mut self.metric);
        env_parse(&lookup, "FACEWATCH_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        env_parse(&lookup, "FACEWATCH_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&lookup, "FACEWATCH_READY_ATTEMPTS", &mut self.ready_attempts);
        env_parse(&lookup, "FACEWATCH_DETECTOR_SCORE_THRESHOLD", &mut self.detector_score_threshold);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be positive, got {}",
                self.match_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.detector_score_threshold) {
            return Err(ConfigError::Invalid(format!(
                "detector_score_threshold must be in [0, 1), got {}",
                self.detector_score_threshold
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be at least 1".into()));
        }
        if self.display_width.is_some() != self.display_height.is_some() {
            return Err(ConfigError::Invalid(
                "display_width and display_height must be set together".into(),
            ));
        }
        if self.display_width == Some(0) || self.display_height == Some(0) {
            return Err(ConfigError::Invalid("display size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn display_size(&self) -> Option<(u32, u32)> {
        self.display_width.zip(self.display_height)
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            score_threshold: self.detector_score_threshold,
            ..DetectorOptions::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}
