//! Face analyzer: the prepared detector+embedder behind one narrow interface
//!
//! The request path only sees [`FaceAnalyzer`], so the concrete ONNX backend
//! can be swapped or mocked without touching selection or normalization.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use tracing::{info, warn};

use crate::config::ModelConfig;

use super::detector::FaceDetector;
use super::embedder::FaceEmbedder;
use super::preprocess::align_face;

/// One face candidate produced per detection: bounding box in original
/// image coordinates, detection confidence, raw (unnormalized) embedding.
/// Request-local, never persisted.
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    pub bbox: [f32; 4],
    pub det_score: Option<f32>,
    pub embedding: Vec<f32>,
}

/// Narrow interface over the opaque detection+recognition capability.
pub trait FaceAnalyzer: Send + Sync {
    /// Detect faces and compute a raw embedding for each. An image with no
    /// faces yields an empty vector; `Err` is reserved for backend failures.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceCandidate>>;
}

const DETECTION_THRESHOLD: f32 = 0.5;

/// ONNX Runtime-backed analyzer. Constructed once at startup and shared
/// read-only for the process lifetime; any construction failure must abort
/// startup rather than leave a partially initialized handle behind.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxAnalyzer {
    /// Prepare the detector and embedder from configuration. Invoked exactly
    /// once, before the server starts accepting requests.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let det_size = config.det_size()?;
        let providers = resolve_providers(&config.providers(), config.device_id);

        let start = std::time::Instant::now();
        let detector_session = build_session(&config.detector_path(), &providers)
            .context("failed to prepare detector model")?;
        let detector = FaceDetector::new(detector_session, det_size, DETECTION_THRESHOLD)?;

        let embedder_session = build_session(&config.embedder_path(), &providers)
            .context("failed to prepare embedder model")?;
        let embedder = FaceEmbedder::new(embedder_session);

        info!(
            "models prepared in {:?} (det_size {}x{}, device_id {})",
            start.elapsed(),
            det_size.0,
            det_size.1,
            config.device_id
        );

        Ok(Self { detector, embedder })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceCandidate>> {
        let faces = self.detector.detect(image)?;

        let mut candidates = Vec::with_capacity(faces.len());
        for face in &faces {
            let aligned = align_face(image, &face.landmarks)?;
            let embedding = self.embedder.embed(&aligned)?;
            candidates.push(FaceCandidate {
                bbox: [face.x1, face.y1, face.x2, face.y2],
                det_score: Some(face.confidence),
                embedding,
            });
        }
        Ok(candidates)
    }
}

/// Map configured provider names to execution providers, preserving order.
/// Unrecognized names are logged and skipped; with device_id < 0 accelerator
/// providers are dropped. An empty result means plain CPU execution.
fn resolve_providers(names: &[String], device_id: i32) -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::new();
    for name in names {
        match name.as_str() {
            "CUDAExecutionProvider" | "CUDA" => {
                if device_id < 0 {
                    warn!("skipping {name}: device_id is -1 (no accelerator)");
                    continue;
                }
                providers.push(
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                );
            }
            "CPUExecutionProvider" | "CPU" => {
                providers.push(CPUExecutionProvider::default().build());
            }
            other => warn!("skipping unrecognized execution provider {other:?}"),
        }
    }
    providers
}

fn build_session(path: &Path, providers: &[ExecutionProviderDispatch]) -> Result<Session> {
    if !path.exists() {
        bail!("model file not found: {}", path.display());
    }

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(providers)?
        .commit_from_file(path)
        .with_context(|| format!("failed to load model {}", path.display()))?;

    info!(
        "loaded model {} ({} outputs)",
        path.display(),
        session.outputs.len()
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_providers_cpu_only() {
        let providers = resolve_providers(&["CPUExecutionProvider".to_string()], -1);
        assert_eq!(providers.len(), 1);
    }

    #[test]
    fn test_resolve_providers_drops_cuda_without_device() {
        let names = vec![
            "CUDAExecutionProvider".to_string(),
            "CPUExecutionProvider".to_string(),
        ];
        assert_eq!(resolve_providers(&names, -1).len(), 1);
        assert_eq!(resolve_providers(&names, 0).len(), 2);
    }

    #[test]
    fn test_resolve_providers_skips_unknown() {
        let names = vec![
            "FrobnicatorExecutionProvider".to_string(),
            "CPU".to_string(),
        ];
        assert_eq!(resolve_providers(&names, -1).len(), 1);
    }

    #[test]
    fn test_missing_model_file_is_fatal() {
        let config = ModelConfig {
            dir: std::path::PathBuf::from("/nonexistent"),
            detector: "missing.onnx".to_string(),
            embedder: "missing.onnx".to_string(),
            providers: "CPUExecutionProvider".to_string(),
            det_size: "640,640".to_string(),
            device_id: -1,
        };
        assert!(OnnxAnalyzer::load(&config).is_err());
    }
}
