//! REST API response data transfer objects

use serde::Serialize;

/// Success payload of `POST /embed-largest-face`.
#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    /// Unit-L2 embedding, `dim` entries long.
    pub embedding: Vec<f32>,
    pub dim: usize,
    /// Bounding box of the chosen face as [x1, y1, x2, y2].
    pub bbox: [f32; 4],
    /// Detection confidence; null when the model reports none.
    pub det_score: Option<f32>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_det_score_serializes_to_null() {
        let response = EmbedResponse {
            embedding: vec![1.0],
            dim: 1,
            bbox: [1.0, 2.0, 3.0, 4.0],
            det_score: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"det_score\":null"));
        assert!(json.contains("\"bbox\":[1.0,2.0,3.0,4.0]"));
    }

    #[test]
    fn test_present_det_score_serializes_as_number() {
        let response = EmbedResponse {
            embedding: vec![1.0],
            dim: 1,
            bbox: [0.0; 4],
            det_score: Some(0.5),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"det_score\":0.5"));
    }
}
