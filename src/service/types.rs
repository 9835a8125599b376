//! Service layer types

/// Outcome of a successful embedding request: the unit-length embedding of
/// the chosen face, its dimensionality, and where the face was found.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
    pub dim: usize,
    pub bbox: [f32; 4],
    pub det_score: Option<f32>,
}
