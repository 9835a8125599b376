//! SCRFD face detector
//!
//! Decodes the stride-wise score/bbox/landmark outputs of InsightFace SCRFD
//! models into face boxes in original-image coordinates.

use anyhow::{bail, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use tracing::debug;

use super::preprocess::{image_to_nchw, resize_with_padding, ResizeInfo};

const NMS_THRESHOLD: f32 = 0.4;

/// One detected face: bounding box, confidence, 5-point landmarks.
#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: [(f32, f32); 5],
}

/// SCRFD output layout, derived from the model's output count at load time.
#[derive(Debug, Clone, Copy)]
struct ScrfdLayout {
    /// Number of feature-map strides (3 or 5).
    fmc: usize,
    num_anchors: usize,
}

impl ScrfdLayout {
    /// Landmark-bearing SCRFD variants only; the embedder needs landmarks
    /// for alignment, so models without them are rejected at startup.
    fn from_output_count(count: usize) -> Result<Self> {
        match count {
            9 => Ok(Self { fmc: 3, num_anchors: 2 }),
            15 => Ok(Self { fmc: 5, num_anchors: 1 }),
            6 | 10 => bail!(
                "detector model has {count} outputs (no facial landmarks); \
                 a landmark-capable SCRFD model is required"
            ),
            _ => bail!("unrecognized SCRFD output count: {count}"),
        }
    }

    fn strides(&self) -> &'static [usize] {
        if self.fmc == 3 {
            &[8, 16, 32]
        } else {
            &[8, 16, 32, 64, 128]
        }
    }
}

/// SCRFD face detector over an ONNX Runtime session.
///
/// `Session::run` needs exclusive access, so the session sits behind a
/// mutex and inference calls are serialized.
pub struct FaceDetector {
    session: Mutex<Session>,
    layout: ScrfdLayout,
    input_size: (u32, u32),
    confidence_threshold: f32,
}

impl FaceDetector {
    pub fn new(session: Session, input_size: (u32, u32), confidence_threshold: f32) -> Result<Self> {
        let layout = ScrfdLayout::from_output_count(session.outputs.len())?;
        Ok(Self {
            session: Mutex::new(session),
            layout,
            input_size,
            confidence_threshold,
        })
    }

    /// Detect faces in a decoded image. An image without faces yields an
    /// empty vector, not an error.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let resize_info = ResizeInfo::new(image.dimensions(), self.input_size);
        let letterboxed = resize_with_padding(image, self.input_size.0, self.input_size.1);
        let tensor = image_to_nchw(&letterboxed);

        // One stride's worth of flattened outputs per head, in model order:
        // scores[0..fmc], bboxes[fmc..2*fmc], landmarks[2*fmc..3*fmc].
        let raw_outputs: Vec<Vec<f32>> = {
            let mut session = self.session.lock();
            let outputs = session
                .run(ort::inputs![TensorRef::from_array_view(tensor.view())?])
                .context("detector inference failed")?;

            let mut raw = Vec::with_capacity(self.layout.fmc * 3);
            for i in 0..self.layout.fmc * 3 {
                let (_, data) = outputs[i]
                    .try_extract_tensor::<f32>()
                    .with_context(|| format!("detector output {i} is not f32"))?;
                raw.push(data.to_vec());
            }
            raw
        };

        let candidates = self.decode_outputs(&raw_outputs, &resize_info);
        let kept = nms(candidates, NMS_THRESHOLD);
        debug!("detected {} faces after NMS", kept.len());
        Ok(kept)
    }

    fn decode_outputs(&self, raw: &[Vec<f32>], resize_info: &ResizeInfo) -> Vec<FaceBox> {
        let fmc = self.layout.fmc;
        let (input_w, input_h) = (self.input_size.0 as usize, self.input_size.1 as usize);
        let mut boxes = Vec::new();

        for (idx, &stride) in self.layout.strides().iter().enumerate() {
            let scores = &raw[idx];
            let bboxes = &raw[idx + fmc];
            let kps = &raw[idx + fmc * 2];

            let feat_w = input_w / stride;
            let feat_h = input_h / stride;

            for cell in 0..feat_w * feat_h {
                let cx = (cell % feat_w) as f32 * stride as f32;
                let cy = (cell / feat_w) as f32 * stride as f32;

                for anchor in 0..self.layout.num_anchors {
                    let i = cell * self.layout.num_anchors + anchor;
                    let Some(&score) = scores.get(i) else { continue };
                    if score < self.confidence_threshold {
                        continue;
                    }
                    if (i + 1) * 4 > bboxes.len() || (i + 1) * 10 > kps.len() {
                        continue;
                    }

                    // bbox head predicts distances (l, t, r, b) from the
                    // anchor center, in stride units
                    let x1 = cx - bboxes[i * 4] * stride as f32;
                    let y1 = cy - bboxes[i * 4 + 1] * stride as f32;
                    let x2 = cx + bboxes[i * 4 + 2] * stride as f32;
                    let y2 = cy + bboxes[i * 4 + 3] * stride as f32;

                    let mut landmarks = [(0.0f32, 0.0f32); 5];
                    for (j, lm) in landmarks.iter_mut().enumerate() {
                        let lx = cx + kps[i * 10 + j * 2] * stride as f32;
                        let ly = cy + kps[i * 10 + j * 2 + 1] * stride as f32;
                        *lm = resize_info.to_original(lx, ly);
                    }

                    let (ox1, oy1) = resize_info.to_original(x1, y1);
                    let (ox2, oy2) = resize_info.to_original(x2, y2);
                    let max_w = resize_info.original_width as f32;
                    let max_h = resize_info.original_height as f32;

                    boxes.push(FaceBox {
                        x1: ox1.clamp(0.0, max_w),
                        y1: oy1.clamp(0.0, max_h),
                        x2: ox2.clamp(0.0, max_w),
                        y2: oy2.clamp(0.0, max_h),
                        confidence: score,
                        landmarks,
                    });
                }
            }
        }

        boxes
    }
}

/// Intersection over union of two face boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut boxes: Vec<FaceBox>, threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox {
            x1,
            y1,
            x2,
            y2,
            confidence,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(5.0, 5.0, 15.0, 15.0, 0.8);
        // intersection 25, union 175
        assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-4);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(20.0, 20.0, 30.0, 30.0, 0.8);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let boxes = vec![
            face(0.0, 0.0, 10.0, 10.0, 0.7),
            face(1.0, 1.0, 11.0, 11.0, 0.9),
            face(50.0, 50.0, 60.0, 60.0, 0.8),
        ];
        let kept = nms(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        // Highest-confidence overlap survives.
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_layout_from_output_count() {
        let layout = ScrfdLayout::from_output_count(9).unwrap();
        assert_eq!(layout.fmc, 3);
        assert_eq!(layout.num_anchors, 2);
        assert_eq!(layout.strides(), &[8, 16, 32]);

        let layout = ScrfdLayout::from_output_count(15).unwrap();
        assert_eq!(layout.strides().len(), 5);

        assert!(ScrfdLayout::from_output_count(6).is_err());
        assert!(ScrfdLayout::from_output_count(7).is_err());
    }
}
