//! Camera lifecycle: acquire, grab live frames, release.
//!
//! The [`CaptureController`] is the only owner of the device stream. Every
//! `start` is paired with a release: explicitly through `stop`, or when the
//! controller is dropped.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::time::Instant;

/// Requested capture resolution: an ideal size plus a hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            max_width: 1920,
            max_height: 1080,
        }
    }
}

impl CaptureConstraints {
    pub fn accepts(&self, width: u32, height: u32) -> bool {
        width > 0 && height > 0 && width <= self.max_width && height <= self.max_height
    }
}

/// A source of camera streams.
pub trait CameraBackend: Send {
    type Stream: FrameStream;

    /// Open the device. The returned stream releases it on drop.
    fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<Self::Stream, CameraError>;
}

/// An open device producing frames.
pub trait FrameStream: Send {
    /// Grab the current frame.
    fn grab(&mut self) -> Result<Frame, CameraError>;

    fn resolution(&self) -> (u32, u32);
}

/// The live camera handle. Exclusively owned by its controller.
pub struct CaptureSession<S> {
    stream: S,
    started_at: Instant,
}

impl<S: FrameStream> CaptureSession<S> {
    pub fn resolution(&self) -> (u32, u32) {
        self.stream.resolution()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

pub struct CaptureController<B: CameraBackend> {
    backend: B,
    constraints: CaptureConstraints,
    session: Option<CaptureSession<B::Stream>>,
}

impl<B: CameraBackend> CaptureController<B> {
    pub fn new(backend: B, constraints: CaptureConstraints) -> Self {
        Self {
            backend,
            constraints,
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn constraints(&self) -> &CaptureConstraints {
        &self.constraints
    }

    /// Acquire the camera. A no-op returning the live session if already started.
    pub fn start(&mut self) -> Result<&CaptureSession<B::Stream>, CameraError> {
        if self.session.is_none() {
            let stream = self.backend.acquire(&self.constraints)?;
            let (width, height) = stream.resolution();
            tracing::info!(width, height, "capture started");
            self.session = Some(CaptureSession {
                stream,
                started_at: Instant::now(),
            });
        }
        self.session.as_ref().ok_or(CameraError::NotStarted)
    }

    /// Release the camera. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!(
                active_ms = session.started_at.elapsed().as_millis() as u64,
                "capture stopped"
            );
            drop(session);
        }
    }

    /// Grab the current frame from the live session.
    pub fn frame(&mut self) -> Result<Frame, CameraError> {
        let session = self.session.as_mut().ok_or(CameraError::NotStarted)?;
        session.stream.grab()
    }
}

impl<B: CameraBackend> Drop for CaptureController<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct Counters {
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    struct FakeStream {
        counters: Counters,
    }

    impl FrameStream for FakeStream {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            Ok(Frame {
                data: vec![0; 4 * 2 * 3],
                width: 4,
                height: 2,
                timestamp: Instant::now(),
                sequence: 1,
            })
        }

        fn resolution(&self) -> (u32, u32) {
            (4, 2)
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeBackend {
        counters: Counters,
        deny: bool,
    }

    impl CameraBackend for FakeBackend {
        type Stream = FakeStream;

        fn acquire(&mut self, _: &CaptureConstraints) -> Result<FakeStream, CameraError> {
            if self.deny {
                return Err(CameraError::PermissionDenied("/dev/video0".into()));
            }
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(FakeStream {
                counters: self.counters.clone(),
            })
        }
    }

    fn controller(deny: bool) -> (CaptureController<FakeBackend>, Counters) {
        let counters = Counters::default();
        let backend = FakeBackend {
            counters: counters.clone(),
            deny,
        };
        (CaptureController::new(backend, CaptureConstraints::default()), counters)
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mut c, counters) = controller(false);
        c.start().unwrap();
        c.start().unwrap();
        assert!(c.is_active());
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let (mut c, counters) = controller(false);
        c.start().unwrap();
        c.stop();
        c.stop();
        assert!(!c.is_active());
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_without_start() {
        let (mut c, counters) = controller(false);
        c.stop();
        assert!(!c.is_active());
        assert_eq!(counters.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_releases_device() {
        let (mut c, counters) = controller(false);
        c.start().unwrap();
        drop(c);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_denied_leaves_inactive() {
        let (mut c, _) = controller(true);
        let err = c.start().err().unwrap();
        assert!(err.is_device_unavailable());
        assert!(!c.is_active());
    }

    #[test]
    fn test_frame_requires_start() {
        let (mut c, _) = controller(false);
        assert!(matches!(c.frame(), Err(CameraError::NotStarted)));
        c.start().unwrap();
        assert!(c.frame().unwrap().is_ready());
        c.stop();
        assert!(matches!(c.frame(), Err(CameraError::NotStarted)));
    }

    #[test]
    fn test_restart_after_stop() {
        let (mut c, counters) = controller(false);
        c.start().unwrap();
        c.stop();
        c.start().unwrap();
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_constraints_cap() {
        let c = CaptureConstraints::default();
        assert!(c.accepts(1280, 720));
        assert!(c.accepts(1920, 1080));
        assert!(!c.accepts(3840, 2160));
        assert!(!c.accepts(0, 720));
    }
}
