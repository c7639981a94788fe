use persona_core::analyzer::AnalyzerError;
use persona_core::{
    classify, random_profile, run_cascade, BoundingBox, CascadeConfig, Confidence,
    DetectionResult, FaceAnalyzer, ModelRegistry, OnnxAnalyzer, PassOutcome, ProfileType,
    OCCLUSION_PROFILE,
};
use persona_hw::Frame;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame not ready: {width}x{height}")]
    FrameNotReady { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    Inference(#[from] AnalyzerError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Why a scan fell back to a random profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCause {
    /// The inference runtime failed mid-scan.
    InferenceFault,
    /// Models never loaded; no inference was attempted.
    ModelsUnavailable,
}

/// Terminal result of one scan attempt.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Resolved {
        detection: DetectionResult,
        profile: ProfileType,
    },
    Degraded {
        detection: DetectionResult,
        face: BoundingBox,
    },
    FallbackRandom {
        profile: ProfileType,
        cause: FallbackCause,
    },
    NoFace,
}

impl ScanOutcome {
    /// The assigned profile, or `None` if the user must retry.
    pub fn profile(&self) -> Option<ProfileType> {
        match self {
            ScanOutcome::Resolved { profile, .. } => Some(*profile),
            ScanOutcome::Degraded { .. } => Some(OCCLUSION_PROFILE),
            ScanOutcome::FallbackRandom { profile, .. } => Some(*profile),
            ScanOutcome::NoFace => None,
        }
    }

    pub fn detection(&self) -> Option<&DetectionResult> {
        match self {
            ScanOutcome::Resolved { detection, .. } | ScanOutcome::Degraded { detection, .. } => {
                Some(detection)
            }
            _ => None,
        }
    }

    pub fn confidence(&self) -> Confidence {
        self.detection()
            .map(|d| d.confidence)
            .unwrap_or(Confidence::None)
    }
}

/// Messages sent from the session to the engine thread.
struct ScanRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<PassOutcome, AnalyzerError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
struct EngineHandle {
    tx: mpsc::Sender<ScanRequest>,
}

impl EngineHandle {
    async fn detect(&self, frame: Frame) -> Result<PassOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the analyzer on a dedicated OS thread.
///
/// Inference blocks; running it off the async runtime keeps the session
/// responsive to teardown while a scan is in flight.
fn spawn_engine(
    mut analyzer: Box<dyn FaceAnalyzer>,
    cascade: CascadeConfig,
) -> Result<EngineHandle, EngineError> {
    // One request at a time; the session never has more than one in flight.
    let (tx, mut rx) = mpsc::channel::<ScanRequest>(1);

    std::thread::Builder::new()
        .name("persona-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(ScanRequest { frame, reply }) = rx.blocking_recv() {
                let result = run_cascade(
                    analyzer.as_mut(),
                    &frame.data,
                    frame.width,
                    frame.height,
                    &cascade,
                );
                let _ = reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Turns frames into [`ScanOutcome`]s.
///
/// Without an analyzer (models unavailable) every scan is simulated and
/// resolves to a random profile without touching the frame.
pub struct RecognitionEngine {
    handle: Option<EngineHandle>,
}

impl RecognitionEngine {
    /// Build from a settled registry. Falls back to simulated mode unless
    /// the registry is ready.
    pub fn from_registry(registry: &mut ModelRegistry, cascade: CascadeConfig) -> Self {
        match registry.take_models() {
            Some(models) => Self::with_analyzer(Box::new(OnnxAnalyzer::new(models)), cascade)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "engine unavailable; using simulated recognition");
                    Self::simulated()
                }),
            None => {
                tracing::info!(state = ?registry.state(), "models not ready; using simulated recognition");
                Self::simulated()
            }
        }
    }

    pub fn with_analyzer(
        analyzer: Box<dyn FaceAnalyzer>,
        cascade: CascadeConfig,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            handle: Some(spawn_engine(analyzer, cascade)?),
        })
    }

    pub fn simulated() -> Self {
        Self { handle: None }
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_some()
    }

    /// Reject frames the analyzer cannot use.
    pub fn check_frame(frame: &Frame) -> Result<(), EngineError> {
        if frame.is_ready() {
            Ok(())
        } else {
            Err(EngineError::FrameNotReady {
                width: frame.width,
                height: frame.height,
            })
        }
    }

    /// Run one scan. Only `FrameNotReady` is returned as an error; inference
    /// faults degrade to a random profile.
    pub async fn scan(
        &self,
        frame: Option<Frame>,
        rng: &mut (dyn RngCore + Send),
    ) -> Result<ScanOutcome, EngineError> {
        let Some(handle) = &self.handle else {
            tracing::info!("simulated scan");
            return Ok(ScanOutcome::FallbackRandom {
                profile: random_profile(rng),
                cause: FallbackCause::ModelsUnavailable,
            });
        };

        let frame = frame.ok_or(EngineError::FrameNotReady { width: 0, height: 0 })?;
        Self::check_frame(&frame)?;

        match handle.detect(frame).await {
            Ok(PassOutcome::Face(analysis)) => {
                let detection = DetectionResult::from(&analysis);
                let profile = classify(&detection, rng);
                tracing::info!(
                    age = analysis.age,
                    gender = ?analysis.gender,
                    profile = %profile,
                    "face resolved"
                );
                Ok(ScanOutcome::Resolved { detection, profile })
            }
            Ok(PassOutcome::Occluded(face)) => {
                tracing::info!(profile = %OCCLUSION_PROFILE, "occluded face; applying occlusion profile");
                Ok(ScanOutcome::Degraded {
                    detection: DetectionResult::occluded(),
                    face,
                })
            }
            Ok(PassOutcome::NoFace) => {
                tracing::info!("no face detected");
                Ok(ScanOutcome::NoFace)
            }
            Err(err) => {
                tracing::error!(error = %err, "inference fault; assigning random profile");
                Ok(ScanOutcome::FallbackRandom {
                    profile: random_profile(rng),
                    cause: FallbackCause::InferenceFault,
                })
            }
        }
    }
}
