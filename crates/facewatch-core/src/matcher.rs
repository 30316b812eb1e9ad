//! Nearest-label matching of a query embedding against a gallery snapshot.

use crate::gallery::GallerySnapshot;
use crate::types::{Embedding, LabeledEmbedding};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Distance below which a query is attributed to a registered label.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Label reported when no registered entry is close enough.
pub const UNKNOWN_LABEL: &str = "unknown";

/// How two embeddings are compared. Lower = more similar for every metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other} (expected euclidean or cosine)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "lowercase")]
pub enum MatchLabel {
    Known(String),
    Unknown,
}

impl MatchLabel {
    pub fn as_str(&self) -> &str {
        match self {
            MatchLabel::Known(label) => label,
            MatchLabel::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, MatchLabel::Known(_))
    }
}

/// Best match for one query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub label: MatchLabel,
    pub distance: f32,
}

impl fmt::Display for MatchResult {
    /// `Bob (0.42)`, `unknown (0.73)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.label.as_str(), self.distance)
    }
}

/// Matches query embeddings against a fixed gallery snapshot.
///
/// Rebuilt whenever the gallery grows; holds no state beyond the snapshot,
/// threshold and metric.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    snapshot: GallerySnapshot,
    threshold: f32,
    metric: DistanceMetric,
}

impl FaceMatcher {
    pub fn new(snapshot: GallerySnapshot, threshold: f32, metric: DistanceMetric) -> Self {
        Self { snapshot, threshold, metric }
    }

    /// Mean distance from `query` to every embedding registered in `entry`.
    fn entry_distance(&self, query: &Embedding, entry: &LabeledEmbedding) -> f32 {
        if entry.embeddings.is_empty() {
            return f32::INFINITY;
        }
        let total: f32 = entry
            .embeddings
            .iter()
            .map(|e| self.metric.distance(query, e))
            .sum();
        total / entry.embeddings.len() as f32
    }

    /// Closest entry to `query`; `unknown` unless its distance is strictly
    /// below the threshold. The earliest entry wins ties.
    pub fn find_best_match(&self, query: &Embedding) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in self.snapshot.iter().enumerate() {
            let distance = self.entry_distance(query, entry);
            if best_idx.is_none() || distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance < self.threshold => MatchResult {
                label: MatchLabel::Known(self.snapshot[idx].label.clone()),
                distance: best_distance,
            },
            _ => MatchResult {
                label: MatchLabel::Unknown,
                distance: best_distance,
            },
        }
    }
}
