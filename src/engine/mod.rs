//! Inference engine module
//!
//! ONNX Runtime-backed face detection and embedding, exposed through the
//! narrow [`FaceAnalyzer`] interface so the request path never touches the
//! concrete backend.

pub mod analyzer;
pub mod detector;
pub mod embedder;
pub mod preprocess;

pub use analyzer::{FaceAnalyzer, FaceCandidate, OnnxAnalyzer};
pub use detector::FaceDetector;
pub use embedder::FaceEmbedder;
