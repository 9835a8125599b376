//! ArcFace face embedder
//!
//! Maps an aligned 112x112 face crop to a raw identity embedding. The
//! vector comes back unnormalized; unit-length scaling happens in the
//! request pipeline.

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;

use super::preprocess::{image_to_nchw, EMBEDDER_INPUT_SIZE};

/// ArcFace embedder over an ONNX Runtime session. Inference calls are
/// serialized behind a mutex, same as the detector.
pub struct FaceEmbedder {
    session: Mutex<Session>,
}

impl FaceEmbedder {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }

    /// Produce the raw embedding vector for an aligned face crop.
    pub fn embed(&self, aligned_face: &DynamicImage) -> Result<Vec<f32>> {
        let (target_w, target_h) = EMBEDDER_INPUT_SIZE;
        let resized = aligned_face.resize_exact(
            target_w,
            target_h,
            image::imageops::FilterType::Lanczos3,
        );
        let tensor = image_to_nchw(&resized);

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![TensorRef::from_array_view(tensor.view())?])
            .context("embedder inference failed")?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("embedder output is not f32")?;

        Ok(data.to_vec())
    }
}
