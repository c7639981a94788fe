//! persona-core: face analysis and customer-profile classification.
//!
//! A tiny-YOLO face detector plus landmark, expression, and age/gender
//! nets run via ONNX Runtime; a rule-based classifier maps the result to
//! one of four customer profiles.

pub mod analyzer;
pub mod attributes;
pub mod classifier;
pub mod detector;
pub mod registry;
pub mod types;

pub use analyzer::{run_cascade, CascadeConfig, FaceAnalyzer, OnnxAnalyzer, PassOutcome};
pub use classifier::{classify, random_profile, OCCLUSION_PROFILE};
pub use detector::DetectorOptions;
pub use registry::{LoadState, ModelKind, ModelRegistry};
pub use types::{
    BoundingBox, Confidence, DetectionResult, Expression, ExpressionScores, FaceAnalysis, Gender,
    ProfileType,
};

/// Default model directory: `$XDG_DATA_HOME/persona/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("persona").join("models")
}
