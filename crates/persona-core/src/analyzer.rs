//! Face analysis seam and the two-pass detection cascade.

use crate::attributes::{self, AgeGenderNet, AttributeError, ExpressionNet, LandmarkNet};
use crate::detector::{DetectorError, DetectorOptions, FaceDetector};
use crate::registry::LoadedModels;
use crate::types::{BoundingBox, FaceAnalysis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("attribute error: {0}")]
    Attribute(#[from] AttributeError),
}

/// Inference backend for a single RGB frame.
///
/// Both methods return `Ok(None)` when no face clears the threshold; `Err`
/// is reserved for runtime faults.
pub trait FaceAnalyzer: Send {
    /// Detect the most confident face and run landmarks, expressions, and
    /// age/gender on it.
    fn analyze(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        options: &DetectorOptions,
    ) -> Result<Option<FaceAnalysis>, AnalyzerError>;

    /// Detect the most confident face box only.
    fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        options: &DetectorOptions,
    ) -> Result<Option<BoundingBox>, AnalyzerError>;
}

/// Thresholds for the primary and occlusion passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeConfig {
    pub primary: DetectorOptions,
    /// Much lower threshold: covered faces lose landmark confidence but can
    /// still register a weak box.
    pub occlusion: DetectorOptions,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            primary: DetectorOptions {
                input_size: 224,
                score_threshold: 0.5,
            },
            occlusion: DetectorOptions {
                input_size: 224,
                score_threshold: 0.15,
            },
        }
    }
}

/// What the cascade found in one frame.
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// Primary pass found a face with full attributes.
    Face(FaceAnalysis),
    /// Only the low-threshold pass found a box.
    Occluded(BoundingBox),
    /// Neither pass found anything.
    NoFace,
}

/// Run the primary pass, then the occlusion pass on the same frame.
pub fn run_cascade(
    analyzer: &mut dyn FaceAnalyzer,
    frame: &[u8],
    width: u32,
    height: u32,
    config: &CascadeConfig,
) -> Result<PassOutcome, AnalyzerError> {
    if let Some(face) = analyzer.analyze(frame, width, height, &config.primary)? {
        tracing::debug!(
            confidence = face.face.confidence,
            age = face.age,
            gender = ?face.gender,
            "primary pass found face"
        );
        return Ok(PassOutcome::Face(face));
    }

    tracing::debug!(
        threshold = config.occlusion.score_threshold,
        "primary pass found no face; retrying at occlusion threshold"
    );
    if let Some(face) = analyzer.locate(frame, width, height, &config.occlusion)? {
        tracing::info!(confidence = face.confidence, "low-confidence face found; treating as occluded");
        return Ok(PassOutcome::Occluded(face));
    }

    Ok(PassOutcome::NoFace)
}

/// [`FaceAnalyzer`] over the ONNX models from the registry.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    landmarks: LandmarkNet,
    expressions: ExpressionNet,
    age_gender: AgeGenderNet,
}

impl OnnxAnalyzer {
    pub fn new(models: LoadedModels) -> Self {
        let LoadedModels {
            detector,
            landmarks,
            recognition: _,
            expression,
            age_gender,
        } = models;
        Self {
            detector: FaceDetector::new(detector),
            landmarks: LandmarkNet::new(landmarks),
            expressions: ExpressionNet::new(expression),
            age_gender: AgeGenderNet::new(age_gender),
        }
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        options: &DetectorOptions,
    ) -> Result<Option<FaceAnalysis>, AnalyzerError> {
        let Some(face) = self.locate(frame, width, height, options)? else {
            return Ok(None);
        };

        let landmarks = self.landmarks.landmarks(frame, width, height, &face)?;
        let region = attributes::aligned_box(&landmarks, width, height).unwrap_or_else(|| face.clone());

        let expressions = self.expressions.expressions(frame, width, height, &region)?;
        let ag = self.age_gender.predict(frame, width, height, &region)?;

        Ok(Some(FaceAnalysis {
            face,
            landmarks,
            expressions,
            age: ag.age,
            gender: ag.gender,
            gender_probability: ag.gender_probability,
        }))
    }

    fn locate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        options: &DetectorOptions,
    ) -> Result<Option<BoundingBox>, AnalyzerError> {
        let faces = self.detector.detect(frame, width, height, options)?;
        Ok(faces.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExpressionScores, Gender};

    /// Scripted analyzer recording which passes ran and at what threshold.
    #[derive(Default)]
    struct Scripted {
        full: Option<FaceAnalysis>,
        weak: Option<BoundingBox>,
        fail: bool,
        calls: Vec<(&'static str, f32)>,
    }

    impl FaceAnalyzer for Scripted {
        fn analyze(
            &mut self,
            _: &[u8],
            _: u32,
            _: u32,
            options: &DetectorOptions,
        ) -> Result<Option<FaceAnalysis>, AnalyzerError> {
            self.calls.push(("analyze", options.score_threshold));
            if self.fail {
                return Err(DetectorError::InferenceFailed("boom".into()).into());
            }
            Ok(self.full.clone())
        }

        fn locate(
            &mut self,
            _: &[u8],
            _: u32,
            _: u32,
            options: &DetectorOptions,
        ) -> Result<Option<BoundingBox>, AnalyzerError> {
            self.calls.push(("locate", options.score_threshold));
            Ok(self.weak.clone())
        }
    }

    fn bbox() -> BoundingBox {
        BoundingBox { x: 10.0, y: 10.0, width: 50.0, height: 50.0, confidence: 0.2 }
    }

    fn analysis() -> FaceAnalysis {
        FaceAnalysis {
            face: BoundingBox { confidence: 0.9, ..bbox() },
            landmarks: vec![],
            expressions: ExpressionScores::from_probabilities(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            age: 34.0,
            gender: Gender::Male,
            gender_probability: 0.8,
        }
    }

    #[test]
    fn test_cascade_primary_hit_skips_occlusion_pass() {
        let mut a = Scripted { full: Some(analysis()), weak: Some(bbox()), ..Default::default() };
        let out = run_cascade(&mut a, &[], 4, 4, &CascadeConfig::default()).unwrap();
        assert!(matches!(out, PassOutcome::Face(_)));
        assert_eq!(a.calls, vec![("analyze", 0.5)]);
    }

    #[test]
    fn test_cascade_falls_back_to_low_threshold() {
        let mut a = Scripted { weak: Some(bbox()), ..Default::default() };
        let out = run_cascade(&mut a, &[], 4, 4, &CascadeConfig::default()).unwrap();
        assert!(matches!(out, PassOutcome::Occluded(_)));
        assert_eq!(a.calls, vec![("analyze", 0.5), ("locate", 0.15)]);
    }

    #[test]
    fn test_cascade_no_face() {
        let mut a = Scripted::default();
        let out = run_cascade(&mut a, &[], 4, 4, &CascadeConfig::default()).unwrap();
        assert!(matches!(out, PassOutcome::NoFace));
        assert_eq!(a.calls.len(), 2);
    }

    #[test]
    fn test_cascade_fault_propagates_without_second_pass() {
        let mut a = Scripted { fail: true, weak: Some(bbox()), ..Default::default() };
        assert!(run_cascade(&mut a, &[], 4, 4, &CascadeConfig::default()).is_err());
        assert_eq!(a.calls, vec![("analyze", 0.5)]);
    }
}
