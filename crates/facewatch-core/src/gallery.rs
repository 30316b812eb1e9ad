//! Append-only, in-memory gallery of labeled face embeddings.

use crate::types::{Embedding, LabeledEmbedding};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("embedding dimension mismatch: gallery holds {expected}-d embeddings, got {actual}-d")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Immutable view of the gallery at one point in time.
///
/// Later registrations never change a snapshot that was already taken.
pub type GallerySnapshot = Arc<Vec<LabeledEmbedding>>;

/// Registered faces, in registration order.
#[derive(Debug, Default)]
pub struct FaceGallery {
    entries: Arc<Vec<LabeledEmbedding>>,
}

impl FaceGallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new entry for `label` holding a single embedding.
    ///
    /// Repeated labels create separate entries. On error the gallery is
    /// left untouched.
    pub fn add(&mut self, label: &str, embedding: Embedding) -> Result<&LabeledEmbedding, GalleryError> {
        if label.trim().is_empty() {
            return Err(GalleryError::EmptyLabel);
        }

        let expected = self
            .entries
            .first()
            .and_then(|e| e.embeddings.first())
            .map(Embedding::dim);
        match expected {
            Some(expected) if expected != embedding.dim() => {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
            None if embedding.dim() == 0 => {
                return Err(GalleryError::DimensionMismatch { expected: 1, actual: 0 });
            }
            _ => {}
        }

        let entry = LabeledEmbedding {
            id: Uuid::new_v4(),
            label: label.to_string(),
            embeddings: vec![embedding],
            registered_at: Utc::now(),
        };
        tracing::debug!(label, id = %entry.id, "gallery: entry added");

        // Clones the backing vector only while an older snapshot is still alive.
        let entries = Arc::make_mut(&mut self.entries);
        entries.push(entry);
        Ok(&entries[entries.len() - 1])
    }

    pub fn snapshot(&self) -> GallerySnapshot {
        Arc::clone(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct labels, in order of first registration.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for entry in self.entries.iter() {
            if !labels.contains(&entry.label.as_str()) {
                labels.push(&entry.label);
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros(dim: usize) -> Embedding {
        Embedding::new(vec![0.0; dim])
    }

    #[test]
    fn test_len_counts_every_successful_add() {
        let mut gallery = FaceGallery::new();
        for label in ["alice", "bob", "alice", "alice"] {
            gallery.add(label, zeros(4)).unwrap();
        }
        assert_eq!(gallery.len(), 4);
        assert_eq!(gallery.labels(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_repeated_label_creates_distinct_entries() {
        let mut gallery = FaceGallery::new();
        let first = gallery.add("bob", zeros(2)).unwrap().id;
        let second = gallery.add("bob", zeros(2)).unwrap().id;
        assert_ne!(first, second);
        let snapshot = gallery.snapshot();
        assert!(snapshot.iter().all(|e| e.embeddings.len() == 1));
    }

    #[test]
    fn test_empty_label_rejected() {
        let mut gallery = FaceGallery::new();
        assert_eq!(gallery.add("", zeros(3)).unwrap_err(), GalleryError::EmptyLabel);
        assert_eq!(gallery.add("   ", zeros(3)).unwrap_err(), GalleryError::EmptyLabel);
        assert_eq!(gallery.add("\t\n", zeros(3)).unwrap_err(), GalleryError::EmptyLabel);
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut gallery = FaceGallery::new();
        gallery.add("alice", zeros(128)).unwrap();
        let err = gallery.add("bob", zeros(512)).unwrap_err();
        assert_eq!(err, GalleryError::DimensionMismatch { expected: 128, actual: 512 });
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let mut gallery = FaceGallery::new();
        assert!(gallery.add("alice", zeros(0)).is_err());
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_adds() {
        let mut gallery = FaceGallery::new();
        gallery.add("alice", zeros(2)).unwrap();
        let before = gallery.snapshot();
        gallery.add("bob", zeros(2)).unwrap();
        let after = gallery.snapshot();

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].label, "alice");
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].label, "bob");
    }
}
