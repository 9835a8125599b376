//! Embedding service - core request pipeline
//!
//! Composes decode, detection, largest-face selection, and normalization,
//! and classifies every failure into the response taxonomy.

use std::sync::Arc;

use thiserror::Error;

use crate::engine::preprocess::decode_image;
use crate::engine::{FaceAnalyzer, FaceCandidate};
use crate::utils::math::l2_normalized;

use super::types::EmbeddingResult;

/// Per-request failure taxonomy. Each variant is terminal for its request
/// and maps to exactly one client-facing outcome; none of them touch the
/// shared model handle.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Empty file")]
    EmptyUpload,
    #[error("{0}")]
    Decode(String),
    #[error("No face detected")]
    NoFace,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Pick the candidate with the strictly greatest bounding-box area.
///
/// Ties keep the first-encountered candidate, so selection is reproducible
/// for a given detection order. Returns `None` only for an empty slice.
pub fn select_largest(candidates: &[FaceCandidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    let mut best_area = -1.0f32;
    for (i, c) in candidates.iter().enumerate() {
        let area = (c.bbox[2] - c.bbox[0]).max(0.0) * (c.bbox[3] - c.bbox[1]).max(0.0);
        if area > best_area {
            best_area = area;
            best = Some(i);
        }
    }
    best
}

/// Face embedding service, generic over the analyzer so tests can
/// substitute a mock backend.
pub struct EmbedService<A: FaceAnalyzer> {
    analyzer: Arc<A>,
}

impl<A: FaceAnalyzer + 'static> EmbedService<A> {
    pub fn new(analyzer: Arc<A>) -> Self {
        Self { analyzer }
    }

    /// Run the full pipeline for one uploaded payload:
    /// decode -> detect -> select largest -> normalize.
    ///
    /// Decode and inference are CPU-bound, so they run on the blocking
    /// pool and never stall other in-flight requests.
    pub async fn embed_largest_face(&self, data: &[u8]) -> Result<EmbeddingResult, EmbedError> {
        if data.is_empty() {
            return Err(EmbedError::EmptyUpload);
        }

        let analyzer = self.analyzer.clone();
        let data = data.to_vec();
        let mut candidates = tokio::task::spawn_blocking(move || {
            let image = decode_image(&data).map_err(|e| EmbedError::Decode(e.to_string()))?;
            analyzer.detect(&image).map_err(EmbedError::Internal)
        })
        .await
        .map_err(|e| EmbedError::Internal(e.into()))??;

        let index = select_largest(&candidates).ok_or(EmbedError::NoFace)?;
        let face = candidates.swap_remove(index);

        let embedding = l2_normalized(face.embedding);
        Ok(EmbeddingResult {
            dim: embedding.len(),
            embedding,
            bbox: face.bbox,
            det_score: face.det_score,
        })
    }
}
