use persona_core::{CascadeConfig, DetectorOptions};
use persona_hw::CaptureConstraints;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// How long a result stays on screen before it is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealTimings {
    /// Resolved and occlusion results.
    pub detected: Duration,
    /// Random pick after an inference fault.
    pub fallback: Duration,
    /// Simulated scan when models are unavailable.
    pub simulated: Duration,
}

impl Default for RevealTimings {
    fn default() -> Self {
        Self {
            detected: Duration::from_millis(1500),
            fallback: Duration::from_millis(800),
            simulated: Duration::from_millis(2000),
        }
    }
}

/// Runtime configuration: defaults, then an optional TOML file, then
/// `PERSONA_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path of the user-facing camera (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the five ONNX model files.
    pub model_dir: PathBuf,
    /// Number of warmup frames to discard after the camera opens.
    pub warmup_frames: usize,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Detector input side for both passes (multiple of 32).
    pub input_size: u32,
    /// Score threshold for the primary pass.
    pub primary_threshold: f32,
    /// Score threshold for the occluded-face pass.
    pub occlusion_threshold: f32,
    pub reveal_detected_ms: u64,
    pub reveal_fallback_ms: u64,
    pub reveal_simulated_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let capture = CaptureConstraints::default();
        let cascade = CascadeConfig::default();
        let reveal = RevealTimings::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: persona_core::default_model_dir(),
            warmup_frames: 4,
            ideal_width: capture.ideal_width,
            ideal_height: capture.ideal_height,
            max_width: capture.max_width,
            max_height: capture.max_height,
            input_size: cascade.primary.input_size,
            primary_threshold: cascade.primary.score_threshold,
            occlusion_threshold: cascade.occlusion.score_threshold,
            reveal_detected_ms: reveal.detected.as_millis() as u64,
            reveal_fallback_ms: reveal.fallback.as_millis() as u64,
            reveal_simulated_ms: reveal.simulated.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load from `PERSONA_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("PERSONA_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `PERSONA_*` environment overrides.
    pub fn with_env(self) -> Self {
        Self {
            camera_device: std::env::var("PERSONA_CAMERA_DEVICE").unwrap_or(self.camera_device),
            model_dir: std::env::var("PERSONA_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.model_dir),
            warmup_frames: env_parse("PERSONA_WARMUP_FRAMES", self.warmup_frames),
            ideal_width: env_parse("PERSONA_IDEAL_WIDTH", self.ideal_width),
            ideal_height: env_parse("PERSONA_IDEAL_HEIGHT", self.ideal_height),
            max_width: env_parse("PERSONA_MAX_WIDTH", self.max_width),
            max_height: env_parse("PERSONA_MAX_HEIGHT", self.max_height),
            input_size: env_parse("PERSONA_INPUT_SIZE", self.input_size),
            primary_threshold: env_parse("PERSONA_PRIMARY_THRESHOLD", self.primary_threshold),
            occlusion_threshold: env_parse("PERSONA_OCCLUSION_THRESHOLD", self.occlusion_threshold),
            reveal_detected_ms: env_parse("PERSONA_REVEAL_DETECTED_MS", self.reveal_detected_ms),
            reveal_fallback_ms: env_parse("PERSONA_REVEAL_FALLBACK_MS", self.reveal_fallback_ms),
            reveal_simulated_ms: env_parse("PERSONA_REVEAL_SIMULATED_MS", self.reveal_simulated_ms),
        }
    }

    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            ideal_width: self.ideal_width,
            ideal_height: self.ideal_height,
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }

    pub fn cascade(&self) -> CascadeConfig {
        CascadeConfig {
            primary: DetectorOptions {
                input_size: self.input_size,
                score_threshold: self.primary_threshold,
            },
            occlusion: DetectorOptions {
                input_size: self.input_size,
                score_threshold: self.occlusion_threshold,
            },
        }
    }

    pub fn reveal(&self) -> RevealTimings {
        RevealTimings {
            detected: Duration::from_millis(self.reveal_detected_ms),
            fallback: Duration::from_millis(self.reveal_fallback_ms),
            simulated: Duration::from_millis(self.reveal_simulated_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let config = Config::default();
        assert_eq!(config.capture_constraints(), CaptureConstraints::default());
        assert_eq!(config.cascade(), CascadeConfig::default());
        assert_eq!(config.reveal(), RevealTimings::default());
        assert_eq!(config.reveal().detected, Duration::from_millis(1500));
        assert_eq!(config.reveal().fallback, Duration::from_millis(800));
        assert_eq!(config.reveal().simulated, Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video4"
            occlusion_threshold = 0.2
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert!((config.occlusion_threshold - 0.2).abs() < 1e-6);
        assert!((config.primary_threshold - 0.5).abs() < 1e-6);
        assert_eq!(config.input_size, 224);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_toml("input_size = \"big\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/persona.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
