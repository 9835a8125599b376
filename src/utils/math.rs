//! Math utility functions

/// Euclidean (L2) norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Rescale a vector to unit L2 norm for cosine-similarity use.
///
/// A zero vector (or empty vector) is returned unchanged; there is no
/// division by zero and no failure mode.
pub fn l2_normalized(v: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&v);
    if norm > 0.0 {
        v.into_iter().map(|x| x / norm).collect()
    } else {
        v
    }
}
