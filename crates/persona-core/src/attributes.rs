//! Per-face attribute nets via ONNX Runtime: 68-point landmarks,
//! expression distribution, and age/gender.
//!
//! All three share the same 112×112 face-crop input and channel
//! normalization.

use crate::types::{BoundingBox, ExpressionScores, Gender};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

// --- Named constants ---
const FACE_INPUT_SIZE: u32 = 112;
const FACE_MEAN_RGB: [f32; 3] = [122.782, 117.001, 104.298];
const FACE_SCALE: f32 = 255.0;
const LANDMARK_COUNT: usize = 68;
const EXPRESSION_CLASSES: usize = 7;

/// Eye-to-mouth distance as a fraction of the aligned face side.
const ALIGN_EYE_MOUTH_RATIO: f32 = 0.45;
/// Vertical position of the landmark centroid inside the aligned box.
const ALIGN_CENTER_Y: f32 = 0.43;

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("face crop is empty or outside a {width}x{height} frame")]
    InvalidCrop { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// 68-point landmark regressor.
pub struct LandmarkNet {
    session: Session,
}

impl LandmarkNet {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Regress 68 landmarks for `face`, returned in frame coordinates.
    pub fn landmarks(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Vec<(f32, f32)>, AttributeError> {
        let (input, crop) = face_tensor(frame, width, height, face)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("landmarks: {e}")))?;

        if raw.len() < LANDMARK_COUNT * 2 {
            return Err(AttributeError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_COUNT * 2,
                raw.len()
            )));
        }

        Ok(raw[..LANDMARK_COUNT * 2]
            .chunks_exact(2)
            .map(|p| (crop.x + p[0] * crop.width, crop.y + p[1] * crop.height))
            .collect())
    }
}

/// Seven-class facial expression classifier.
pub struct ExpressionNet {
    session: Session,
}

impl ExpressionNet {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn expressions(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<ExpressionScores, AttributeError> {
        let (input, _) = face_tensor(frame, width, height, face)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("expressions: {e}")))?;

        if raw.len() < EXPRESSION_CLASSES {
            return Err(AttributeError::InferenceFailed(format!(
                "expected {EXPRESSION_CLASSES} expression logits, got {}",
                raw.len()
            )));
        }

        Ok(ExpressionScores::from_probabilities(&softmax(
            &raw[..EXPRESSION_CLASSES],
        )))
    }
}

/// Age regressor with a two-class (male, female) gender head.
pub struct AgeGenderNet {
    session: Session,
    /// `(age, gender)` output indices; `None` if the model lacks two heads.
    heads: Option<(usize, usize)>,
    output_count: usize,
}

/// Output of [`AgeGenderNet::predict`].
#[derive(Debug, Clone, Copy)]
pub struct AgeGender {
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

impl AgeGenderNet {
    pub fn new(session: Session) -> Self {
        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let heads = discover_age_gender_indices(&names);
        match heads {
            Some((age_idx, gender_idx)) => {
                tracing::debug!(?names, age_idx, gender_idx, "age/gender output mapping")
            }
            None => tracing::warn!(?names, "age/gender model has fewer than two outputs"),
        }
        Self {
            session,
            heads,
            output_count: names.len(),
        }
    }

    pub fn predict(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<AgeGender, AttributeError> {
        let (age_idx, gender_idx) = self.heads.ok_or_else(|| {
            AttributeError::InferenceFailed(format!(
                "age/gender model needs 2 outputs, has {}",
                self.output_count
            ))
        })?;
        let (input, _) = face_tensor(frame, width, height, face)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, age) = outputs[age_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("age: {e}")))?;
        let (_, gender) = outputs[gender_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("gender: {e}")))?;

        let age = *age
            .first()
            .ok_or_else(|| AttributeError::InferenceFailed("empty age output".into()))?;
        if gender.len() < 2 {
            return Err(AttributeError::InferenceFailed(format!(
                "expected 2 gender logits, got {}",
                gender.len()
            )));
        }

        let probs = softmax(&gender[..2]);
        let (gender, gender_probability) = if probs[0] >= probs[1] {
            (Gender::Male, probs[0])
        } else {
            (Gender::Female, probs[1])
        };

        Ok(AgeGender {
            age: age.max(0.0),
            gender,
            gender_probability,
        })
    }
}

/// Locate the age and gender heads by output name, falling back to
/// positional `[age, gender]` ordering. `None` with fewer than two outputs.
fn discover_age_gender_indices(names: &[String]) -> Option<(usize, usize)> {
    if names.len() < 2 {
        return None;
    }
    let find = |needle: &str| names.iter().position(|n| n.to_lowercase().contains(needle));
    match (find("age"), find("gender")) {
        (Some(a), Some(g)) if a != g => Some((a, g)),
        _ => Some((0, 1)),
    }
}

/// Square box around the face derived from eye and mouth landmarks.
///
/// Attribute nets read a better-centered crop from this box than from the
/// raw detector box.
pub fn aligned_box(landmarks: &[(f32, f32)], width: u32, height: u32) -> Option<BoundingBox> {
    if landmarks.len() < LANDMARK_COUNT {
        return None;
    }
    let left_eye = centroid(&landmarks[36..42]);
    let right_eye = centroid(&landmarks[42..48]);
    let mouth = centroid(&landmarks[48..68]);

    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let eye_to_mouth = (dist(left_eye, mouth) + dist(right_eye, mouth)) / 2.0;
    let size = (eye_to_mouth / ALIGN_EYE_MOUTH_RATIO).floor();
    if size < 1.0 {
        return None;
    }

    let center = centroid(&[left_eye, right_eye, mouth]);
    BoundingBox {
        x: (center.0 - 0.5 * size).floor(),
        y: (center.1 - ALIGN_CENTER_Y * size).floor(),
        width: size,
        height: size,
        confidence: 1.0,
    }
    .clamp_to(width, height)
}

fn centroid(points: &[(f32, f32)]) -> (f32, f32) {
    let n = points.len().max(1) as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

/// Numerically stable softmax.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Square crop region around `face`, clamped to the frame.
fn square_crop(face: &BoundingBox, width: u32, height: u32) -> Option<BoundingBox> {
    let side = face.width.max(face.height);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    BoundingBox {
        x: cx - side / 2.0,
        y: cy - side / 2.0,
        width: side,
        height: side,
        confidence: face.confidence,
    }
    .clamp_to(width, height)
}

/// Crop the face, resize to 112×112, and normalize into an NCHW tensor.
///
/// Returns the tensor and the crop region in frame coordinates.
fn face_tensor(
    frame: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
) -> Result<(Array4<f32>, BoundingBox), AttributeError> {
    let invalid = || AttributeError::InvalidCrop { width, height };
    let needed = width as usize * height as usize * 3;
    if frame.len() < needed {
        return Err(invalid());
    }
    let crop = square_crop(face, width, height).ok_or_else(invalid)?;
    let image = RgbImage::from_raw(width, height, frame[..needed].to_vec()).ok_or_else(invalid)?;

    let patch = imageops::crop_imm(
        &image,
        crop.x as u32,
        crop.y as u32,
        crop.width.max(1.0) as u32,
        crop.height.max(1.0) as u32,
    )
    .to_image();
    let resized = imageops::resize(
        &patch,
        FACE_INPUT_SIZE,
        FACE_INPUT_SIZE,
        imageops::FilterType::Triangle,
    );

    let size = FACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - FACE_MEAN_RGB[c]) / FACE_SCALE;
        }
    }

    Ok((tensor, crop))
}
