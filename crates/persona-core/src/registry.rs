//! Model registry: loads the five named ONNX models once, concurrently.
//!
//! Loading is all-or-nothing. Any missing or unreadable model settles the
//! registry in [`LoadState::Failed`], which callers treat as "run without
//! inference" rather than as an error. There is no automatic retry.

use ort::session::Session;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SESSION_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("load task failed: {0}")]
    TaskFailed(String),
}

/// The named models the pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Detector,
    Landmarks,
    Recognition,
    Expression,
    AgeGender,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Detector,
        ModelKind::Landmarks,
        ModelKind::Recognition,
        ModelKind::Expression,
        ModelKind::AgeGender,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Detector => "tiny_face_detector",
            ModelKind::Landmarks => "face_landmark_68",
            ModelKind::Recognition => "face_recognition",
            ModelKind::Expression => "face_expression",
            ModelKind::AgeGender => "age_gender",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

/// One ONNX session per [`ModelKind`].
///
/// `recognition` is required for readiness but the scan path does not run
/// it.
pub struct LoadedModels {
    pub detector: Session,
    pub landmarks: Session,
    pub recognition: Session,
    pub expression: Session,
    pub age_gender: Session,
}

/// Per-model load report.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub kind: ModelKind,
    pub path: PathBuf,
    pub loaded: bool,
    pub error: Option<String>,
}

pub struct ModelRegistry {
    base_dir: PathBuf,
    state: LoadState,
    models: Option<LoadedModels>,
    statuses: Vec<ModelStatus>,
}

impl ModelRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            state: LoadState::Unloaded,
            models: None,
            statuses: Vec::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LoadState::Ready
    }

    /// Per-model results of the last load. Empty before `load()`.
    pub fn statuses(&self) -> &[ModelStatus] {
        &self.statuses
    }

    /// Load every model concurrently. Settles exactly once; later calls
    /// return the settled state without touching the filesystem.
    pub async fn load(&mut self) -> LoadState {
        if self.state != LoadState::Unloaded {
            tracing::debug!(state = ?self.state, "model registry already settled");
            return self.state;
        }
        self.state = LoadState::Loading;
        tracing::info!(dir = %self.base_dir.display(), "loading models");

        let handles: Vec<_> = ModelKind::ALL
            .iter()
            .map(|&kind| {
                let path = self.base_dir.join(kind.file_name());
                let task_path = path.clone();
                let handle = tokio::task::spawn_blocking(move || load_session(&task_path));
                (kind, path, handle)
            })
            .collect();

        let mut sessions = Vec::with_capacity(handles.len());
        for (kind, path, handle) in handles {
            let result = handle
                .await
                .map_err(|e| RegistryError::TaskFailed(e.to_string()))
                .and_then(|r| r);
            match result {
                Ok(session) => {
                    tracing::debug!(model = kind.name(), "model loaded");
                    self.statuses.push(ModelStatus { kind, path, loaded: true, error: None });
                    sessions.push((kind, session));
                }
                Err(err) => {
                    tracing::warn!(model = kind.name(), error = %err, "model failed to load");
                    self.statuses.push(ModelStatus {
                        kind,
                        path,
                        loaded: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        match assemble(sessions) {
            Some(models) => {
                self.models = Some(models);
                self.state = LoadState::Ready;
                tracing::info!("all models loaded");
            }
            None => {
                self.state = LoadState::Failed;
                tracing::warn!(
                    failed = self.statuses.iter().filter(|s| !s.loaded).count(),
                    "models unavailable; recognition will run in simulated mode"
                );
            }
        }
        self.state
    }

    /// Hand the loaded sessions to an analyzer. `None` unless ready, or if
    /// already taken.
    pub fn take_models(&mut self) -> Option<LoadedModels> {
        self.models.take()
    }
}

fn load_session(path: &Path) -> Result<Session, RegistryError> {
    if !path.exists() {
        return Err(RegistryError::ModelNotFound(path.to_path_buf()));
    }
    let session = Session::builder()?
        .with_intra_threads(SESSION_INTRA_THREADS)?
        .commit_from_file(path)?;
    tracing::trace!(
        path = %path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "session created"
    );
    Ok(session)
}

fn assemble(sessions: Vec<(ModelKind, Session)>) -> Option<LoadedModels> {
    let mut detector = None;
    let mut landmarks = None;
    let mut recognition = None;
    let mut expression = None;
    let mut age_gender = None;
    for (kind, session) in sessions {
        let slot = match kind {
            ModelKind::Detector => &mut detector,
            ModelKind::Landmarks => &mut landmarks,
            ModelKind::Recognition => &mut recognition,
            ModelKind::Expression => &mut expression,
            ModelKind::AgeGender => &mut age_gender,
        };
        *slot = Some(session);
    }
    Some(LoadedModels {
        detector: detector?,
        landmarks: landmarks?,
        recognition: recognition?,
        expression: expression?,
        age_gender: age_gender?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_dir() -> PathBuf {
        std::env::temp_dir().join("persona-registry-test-does-not-exist")
    }

    #[test]
    fn test_model_file_names() {
        let names: Vec<String> = ModelKind::ALL.iter().map(|k| k.file_name()).collect();
        assert_eq!(
            names,
            [
                "tiny_face_detector.onnx",
                "face_landmark_68.onnx",
                "face_recognition.onnx",
                "face_expression.onnx",
                "age_gender.onnx",
            ]
        );
    }

    #[test]
    fn test_new_registry_is_unloaded() {
        let registry = ModelRegistry::new(missing_dir());
        assert_eq!(registry.state(), LoadState::Unloaded);
        assert!(!registry.is_ready());
        assert!(registry.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_missing_models_fail_soft() {
        let mut registry = ModelRegistry::new(missing_dir());
        assert_eq!(registry.load().await, LoadState::Failed);
        assert!(!registry.is_ready());
        assert!(registry.take_models().is_none());

        let statuses = registry.statuses();
        assert_eq!(statuses.len(), ModelKind::ALL.len());
        assert!(statuses.iter().all(|s| !s.loaded && s.error.is_some()));
    }

    #[tokio::test]
    async fn test_load_settles_once() {
        let mut registry = ModelRegistry::new(missing_dir());
        registry.load().await;
        let first = registry.statuses().len();
        assert_eq!(registry.load().await, LoadState::Failed);
        assert_eq!(registry.statuses().len(), first);
    }

    #[test]
    fn test_load_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LoadState::Failed).unwrap(), "\"failed\"");
        assert_eq!(serde_json::to_string(&ModelKind::AgeGender).unwrap(), "\"age_gender\"");
    }
}
