//! Screen-level state machine for one recognition visit.
//!
//! ```text
//! CameraOff ──start──▶ CameraOn ──scan──▶ Scanning ──▶ ResultShown ──delay──▶ Completed
//!     │                  │  ▲                │
//!     │                  │  └── no face / ───┘
//!     │                  │      frame not ready
//!     └──── manual ──────┴──▶ ManualSelected
//! ```
//!
//! A session emits exactly one [`ProfileAssignment`]. Manual selection is
//! available until then, whatever the camera or model state.

use crate::config::{Config, RevealTimings};
use crate::engine::{FallbackCause, RecognitionEngine, ScanOutcome};
use persona_core::{
    Confidence, DetectionResult, LoadState, ModelRegistry, ProfileType, OCCLUSION_PROFILE,
};
use persona_hw::{CameraBackend, CameraError, CaptureConstraints, CaptureController};
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(#[source] CameraError),
    #[error("frame not ready")]
    FrameNotReady,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("camera is off")]
    CameraOff,
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("profile already assigned for this session")]
    AlreadyAssigned,
    #[error("session torn down")]
    TornDown,
}

impl SessionError {
    /// Plain-language prompt for the end user. Never includes technical detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::DeviceUnavailable(_) => {
                "Could not access camera. Please select a profile manually or skip."
            }
            SessionError::FrameNotReady => "Video not ready. Please wait a moment and try again.",
            SessionError::NoFaceDetected => {
                "No face detected. Please position yourself in front of the camera and ensure good lighting."
            }
            SessionError::CameraOff => "Start the camera to scan, or select a profile manually.",
            SessionError::ScanInProgress => "Analyzing face... please wait.",
            SessionError::AlreadyAssigned => "A profile has already been chosen.",
            SessionError::TornDown => "Scan cancelled.",
        }
    }

    /// Whether the user can simply try the scan again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::FrameNotReady | SessionError::NoFaceDetected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "profile", rename_all = "snake_case")]
pub enum SessionState {
    CameraOff,
    CameraOn,
    Scanning,
    ResultShown(ProfileType),
    ManualSelected(ProfileType),
    Completed(ProfileType),
    Closed,
}

impl SessionState {
    fn is_in_flight(&self) -> bool {
        matches!(self, SessionState::Scanning | SessionState::ResultShown(_))
    }

    fn is_assigned(&self) -> bool {
        matches!(self, SessionState::ManualSelected(_) | SessionState::Completed(_))
    }
}

/// How a profile was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    /// Full detection, classified by rules.
    Detected,
    /// Low-confidence face, assumed covered.
    Occlusion,
    /// Random pick after an inference fault.
    InferenceFallback,
    /// Random pick because models were unavailable.
    Simulated,
    Manual,
}

impl AssignmentSource {
    /// How long the result stays on screen before it is emitted.
    pub fn reveal_delay(&self, timings: &RevealTimings) -> Duration {
        match self {
            AssignmentSource::Detected | AssignmentSource::Occlusion => timings.detected,
            AssignmentSource::InferenceFallback => timings.fallback,
            AssignmentSource::Simulated => timings.simulated,
            AssignmentSource::Manual => Duration::ZERO,
        }
    }
}

/// The single value a session hands to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileAssignment {
    pub session_id: Uuid,
    pub profile: ProfileType,
    pub source: AssignmentSource,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionResult>,
}

/// Fires the teardown signal of a session from anywhere.
#[derive(Clone)]
pub struct Teardown {
    tx: Arc<watch::Sender<bool>>,
}

impl Teardown {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// Resolves once teardown fires; never if the signal is gone.
async fn torn_down(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|&down| down).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn transition(state: &watch::Sender<SessionState>, id: Uuid, next: SessionState) {
    let prev = state.send_replace(next);
    if prev != next {
        tracing::debug!(session = %id, from = ?prev, to = ?next, "state transition");
    }
}

/// Holds the camera for the duration of one scan.
///
/// If the scan future is dropped mid-flight, a scan still waiting on
/// inference returns to `CameraOn`. A result already shown is final: the
/// camera is released and the session settles to `Completed`.
struct InFlight<'a, B: CameraBackend> {
    id: Uuid,
    state: &'a watch::Sender<SessionState>,
    capture: &'a mut CaptureController<B>,
}

impl<B: CameraBackend> InFlight<'_, B> {
    fn transition(&self, next: SessionState) {
        transition(self.state, self.id, next);
    }

    fn tear_down(&mut self) -> SessionError {
        self.capture.stop();
        self.transition(SessionState::Closed);
        tracing::info!(session = %self.id, "session torn down");
        SessionError::TornDown
    }
}

impl<B: CameraBackend> Drop for InFlight<'_, B> {
    fn drop(&mut self) {
        let current = *self.state.borrow();
        match current {
            SessionState::Scanning => self.transition(SessionState::CameraOn),
            SessionState::ResultShown(profile) => {
                tracing::warn!(session = %self.id, profile = %profile, "scan abandoned during reveal");
                self.capture.stop();
                self.transition(SessionState::Completed(profile));
            }
            _ => {}
        }
    }
}

pub struct ScanSession<B: CameraBackend> {
    id: Uuid,
    state: watch::Sender<SessionState>,
    capture: CaptureController<B>,
    engine: RecognitionEngine,
    timings: RevealTimings,
    rng: Box<dyn RngCore + Send>,
    teardown_tx: Arc<watch::Sender<bool>>,
    teardown_rx: watch::Receiver<bool>,
}

impl<B: CameraBackend> ScanSession<B> {
    /// Load models (one concurrent batch) and open a session in `CameraOff`.
    ///
    /// Model failure is not an error: the session runs in simulated mode.
    pub async fn open(backend: B, config: &Config, rng: Box<dyn RngCore + Send>) -> Self {
        let mut registry = ModelRegistry::new(&config.model_dir);
        if registry.load().await == LoadState::Failed {
            tracing::warn!(dir = %config.model_dir.display(), "model load failed; simulated recognition");
        }
        let engine = RecognitionEngine::from_registry(&mut registry, config.cascade());
        Self::with_engine(backend, config.capture_constraints(), engine, config.reveal(), rng)
    }

    pub fn with_engine(
        backend: B,
        constraints: CaptureConstraints,
        engine: RecognitionEngine,
        timings: RevealTimings,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::CameraOff);
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let id = Uuid::new_v4();
        tracing::info!(session = %id, models_ready = engine.is_ready(), "session opened");
        Self {
            id,
            state: state_tx,
            capture: CaptureController::new(backend, constraints),
            engine,
            timings,
            rng,
            teardown_tx: Arc::new(teardown_tx),
            teardown_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions, e.g. to render "Analyzing face...".
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn teardown_handle(&self) -> Teardown {
        Teardown {
            tx: self.teardown_tx.clone(),
        }
    }

    pub fn models_ready(&self) -> bool {
        self.engine.is_ready()
    }

    /// Notice to show while models are unavailable.
    pub fn notice(&self) -> Option<&'static str> {
        (!self.engine.is_ready()).then_some("Using fallback recognition mode")
    }

    pub fn camera_active(&self) -> bool {
        self.capture.is_active()
    }

    fn set_state(&self, next: SessionState) {
        transition(&self.state, self.id, next);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Closed => Err(SessionError::TornDown),
            s if s.is_assigned() => Err(SessionError::AlreadyAssigned),
            _ => Ok(()),
        }
    }

    /// `CameraOff → CameraOn`. A no-op if the camera is already on.
    pub fn start_camera(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state().is_in_flight() {
            return Err(SessionError::ScanInProgress);
        }
        if let Err(err) = self.capture.start() {
            tracing::warn!(session = %self.id, error = %err, "camera unavailable");
            return Err(SessionError::DeviceUnavailable(err));
        }
        self.set_state(SessionState::CameraOn);
        Ok(())
    }

    /// `CameraOn → CameraOff`. Safe to call repeatedly.
    pub fn stop_camera(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state().is_in_flight() {
            return Err(SessionError::ScanInProgress);
        }
        self.capture.stop();
        self.set_state(SessionState::CameraOff);
        Ok(())
    }

    /// Pick a profile directly, bypassing inference.
    pub fn select_manual(&mut self, profile: ProfileType) -> Result<ProfileAssignment, SessionError> {
        self.ensure_open()?;
        self.capture.stop();
        self.set_state(SessionState::ManualSelected(profile));
        tracing::info!(session = %self.id, profile = %profile, "manual selection");
        Ok(ProfileAssignment {
            session_id: self.id,
            profile,
            source: AssignmentSource::Manual,
            confidence: Confidence::None,
            detection: None,
        })
    }

    /// Scan the current frame and, after the reveal delay, emit the result.
    ///
    /// `FrameNotReady` and `NoFaceDetected` leave the session in `CameraOn`
    /// so the user can retry. Teardown during the scan or the reveal
    /// releases the camera and returns `TornDown`. Dropping the future
    /// after the result is shown settles the session to `Completed` with
    /// that result; read it back through [`ScanSession::state`].
    pub async fn scan(&mut self) -> Result<ProfileAssignment, SessionError> {
        self.ensure_open()?;
        match self.state() {
            SessionState::CameraOn => {}
            SessionState::CameraOff => return Err(SessionError::CameraOff),
            _ => return Err(SessionError::ScanInProgress),
        }

        let frame = if self.engine.is_ready() {
            let frame = self.capture.frame().map_err(|err| {
                tracing::warn!(session = %self.id, error = %err, "frame grab failed");
                SessionError::FrameNotReady
            })?;
            if let Err(err) = RecognitionEngine::check_frame(&frame) {
                tracing::debug!(session = %self.id, error = %err, "frame rejected");
                return Err(SessionError::FrameNotReady);
            }
            Some(frame)
        } else {
            None
        };

        let mut flight = InFlight {
            id: self.id,
            state: &self.state,
            capture: &mut self.capture,
        };
        flight.transition(SessionState::Scanning);

        let scanned = tokio::select! {
            biased;
            _ = torn_down(&mut self.teardown_rx) => None,
            result = self.engine.scan(frame, self.rng.as_mut()) => Some(result),
        };
        let Some(result) = scanned else {
            return Err(flight.tear_down());
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                // Frame validation is the only error the engine surfaces.
                tracing::debug!(session = %self.id, error = %err, "scan rejected");
                flight.transition(SessionState::CameraOn);
                return Err(SessionError::FrameNotReady);
            }
        };

        let confidence = outcome.confidence();
        let (profile, source, detection) = match outcome {
            ScanOutcome::Resolved { detection, profile } => {
                (profile, AssignmentSource::Detected, Some(detection))
            }
            ScanOutcome::Degraded { detection, .. } => {
                (OCCLUSION_PROFILE, AssignmentSource::Occlusion, Some(detection))
            }
            ScanOutcome::FallbackRandom {
                profile,
                cause: FallbackCause::InferenceFault,
            } => (profile, AssignmentSource::InferenceFallback, None),
            ScanOutcome::FallbackRandom {
                profile,
                cause: FallbackCause::ModelsUnavailable,
            } => (profile, AssignmentSource::Simulated, None),
            ScanOutcome::NoFace => {
                flight.transition(SessionState::CameraOn);
                return Err(SessionError::NoFaceDetected);
            }
        };

        let delay = source.reveal_delay(&self.timings);
        flight.transition(SessionState::ResultShown(profile));
        tracing::info!(
            session = %self.id,
            profile = %profile,
            ?source,
            ?confidence,
            delay_ms = delay.as_millis() as u64,
            "result shown"
        );

        let revealed = tokio::select! {
            biased;
            _ = torn_down(&mut self.teardown_rx) => false,
            _ = tokio::time::sleep(delay) => true,
        };
        if !revealed {
            return Err(flight.tear_down());
        }

        flight.capture.stop();
        flight.transition(SessionState::Completed(profile));
        Ok(ProfileAssignment {
            session_id: self.id,
            profile,
            source,
            confidence,
            detection,
        })
    }

    /// Release the camera and end the session.
    pub fn close(mut self) {
        self.capture.stop();
        self.set_state(SessionState::Closed);
        tracing::info!(session = %self.id, "session closed");
    }
}
