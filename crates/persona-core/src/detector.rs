//! Tiny face detector via ONNX Runtime.
//!
//! Single-class tiny-YOLOv2 head: one 32-pixel stride, five anchors per
//! cell, `[tx, ty, tw, th, objectness]` per anchor. Output is expected in
//! NHWC order, `[1, grid, grid, anchors * 5]`, as exported from the
//! source TensorFlow graph.

use crate::types::BoundingBox;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const TINY_STRIDE: u32 = 32;
const TINY_MEAN_RGB: [f32; 3] = [117.001, 114.697, 97.404];
const TINY_SCALE: f32 = 256.0;
const TINY_BOX_ENCODING: usize = 5;
const TINY_ANCHORS: [(f32, f32); 5] = [
    (1.603_231, 2.094_468),
    (6.041_143, 7.080_126),
    (2.882_459, 3.518_061),
    (4.266_906, 5.178_857),
    (9.041_765, 10.663_08),
];
const TINY_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("input size {0} is not a positive multiple of 32")]
    InvalidInputSize(u32),
    #[error("frame buffer too short for {width}x{height} RGB")]
    InvalidFrame { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-pass detector settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorOptions {
    /// Square network input side, a multiple of 32. Smaller is faster.
    pub input_size: u32,
    /// Minimum objectness score for a box to survive.
    pub score_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            input_size: 224,
            score_threshold: 0.5,
        }
    }
}

impl DetectorOptions {
    fn validate(&self) -> Result<u32, DetectorError> {
        if self.input_size == 0 || self.input_size % TINY_STRIDE != 0 {
            return Err(DetectorError::InvalidInputSize(self.input_size));
        }
        Ok(self.input_size / TINY_STRIDE)
    }
}

/// Tiny-YOLO based face detector.
pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Detect faces in an RGB frame, returning boxes sorted by confidence.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        options: &DetectorOptions,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let grid = options.validate()? as usize;
        let (input, side) = preprocess(frame, width, height, options.input_size)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detector output: {e}")))?;

        let expected = grid * grid * TINY_ANCHORS.len() * TINY_BOX_ENCODING;
        if raw.len() < expected {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {expected} detector values for a {grid}x{grid} grid, got {}",
                raw.len()
            )));
        }

        let boxes = decode_grid(raw, grid, side, options.score_threshold);
        let mut result = nms(boxes, TINY_NMS_THRESHOLD);
        result.retain_mut(|b| match b.clamp_to(width, height) {
            Some(clamped) => {
                *b = clamped;
                true
            }
            None => false,
        });

        tracing::trace!(
            threshold = options.score_threshold,
            faces = result.len(),
            "detector pass complete"
        );

        Ok(result)
    }
}

/// Pad the frame to a square anchored at the top-left, resize to
/// `input_size`, and normalize into an NCHW tensor.
///
/// Returns the tensor and the side of the padded square in source pixels,
/// which maps network-relative coordinates back to the frame.
fn preprocess(
    frame: &[u8],
    width: u32,
    height: u32,
    input_size: u32,
) -> Result<(Array4<f32>, f32), DetectorError> {
    let needed = width as usize * height as usize * 3;
    if width == 0 || height == 0 || frame.len() < needed {
        return Err(DetectorError::InvalidFrame { width, height });
    }
    let image = RgbImage::from_raw(width, height, frame[..needed].to_vec())
        .ok_or(DetectorError::InvalidFrame { width, height })?;

    let side = width.max(height);
    let scale = input_size as f32 / side as f32;
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, input_size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, input_size);
    let resized = imageops::resize(&image, new_w, new_h, imageops::FilterType::Triangle);

    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let rgb = if (x as u32) < new_w && (y as u32) < new_h {
                resized.get_pixel(x as u32, y as u32).0
            } else {
                [0, 0, 0]
            };
            for c in 0..3 {
                tensor[[0, c, y, x]] = (rgb[c] as f32 - TINY_MEAN_RGB[c]) / TINY_SCALE;
            }
        }
    }

    Ok((tensor, side as f32))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode the NHWC grid into frame-space boxes above `threshold`.
fn decode_grid(raw: &[f32], grid: usize, side: f32, threshold: f32) -> Vec<BoundingBox> {
    let mut detections = Vec::new();
    let cell = side / grid as f32;

    for row in 0..grid {
        for col in 0..grid {
            for (a, &(anchor_w, anchor_h)) in TINY_ANCHORS.iter().enumerate() {
                let base = ((row * grid + col) * TINY_ANCHORS.len() + a) * TINY_BOX_ENCODING;
                let score = sigmoid(raw[base + 4]);
                if score <= threshold {
                    continue;
                }

                let cx = (col as f32 + sigmoid(raw[base])) * cell;
                let cy = (row as f32 + sigmoid(raw[base + 1])) * cell;
                let w = raw[base + 2].exp() * anchor_w * cell;
                let h = raw[base + 3].exp() * anchor_h * cell;

                detections.push(BoundingBox {
                    x: cx - w / 2.0,
                    y: cy - h / 2.0,
                    width: w,
                    height: h,
                    confidence: score,
                });
            }
        }
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.right().min(b.right());
    let y2 = a.bottom().min(b.bottom());

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
