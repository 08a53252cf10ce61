use super::slot::LatestFrameSlot;
use crate::backend::{BackendKind, CaptureBackend, CaptureParams, CaptureSession};
use crate::config::CamerasConfig;
use crate::error::OpenError;
use crate::frame::{CameraId, Frame};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a capture worker. `Errored` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Uninitialized,
    Opening,
    Running,
    Stopping,
    Closed,
    Errored,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Opening => "opening",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Closed => "closed",
            WorkerState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Camera availability transitions reported to the status callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraStatus {
    /// First frame captured
    Ready,
    /// Capture gave up on the camera
    Error { reason: String },
}

pub type StatusCallback = Arc<dyn Fn(CameraId, CameraStatus) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub frame_interval: Duration,
    pub read_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_consecutive_failures: u32,
}

impl From<&CamerasConfig> for WorkerSettings {
    fn from(config: &CamerasConfig) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            read_timeout: config.read_timeout(),
            retry_backoff: config.retry_backoff(),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

#[derive(Debug)]
struct WorkerShared {
    slot: LatestFrameSlot,
    state: Mutex<WorkerState>,
    /// Backend and index of the opened session, readable while `stop` joins
    binding: Mutex<Option<(BackendKind, u32)>>,
    read_failures: AtomicU64,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, camera: CameraId, next: WorkerState) {
        let mut state = self.state.lock();
        if *state == WorkerState::Errored || *state == next {
            return;
        }
        debug!("{} worker {} -> {}", camera.label(), *state, next);
        *state = next;
    }
}

#[derive(Default)]
struct WorkerControl {
    /// Held here while the worker is opened but not capturing
    session: Option<Box<dyn CaptureSession>>,
    /// The capture thread hands the session back when it exits
    handle: Option<JoinHandle<Box<dyn CaptureSession>>>,
    stop_tx: Option<Sender<()>>,
}

/// Owns one camera session and keeps its latest frame fresh from a
/// dedicated capture thread.
pub struct CaptureWorker {
    camera: CameraId,
    settings: WorkerSettings,
    shared: Arc<WorkerShared>,
    control: Mutex<WorkerControl>,
}

impl CaptureWorker {
    pub fn new(camera: CameraId, settings: WorkerSettings) -> Self {
        Self {
            camera,
            settings,
            shared: Arc::new(WorkerShared {
                slot: LatestFrameSlot::new(),
                state: Mutex::new(WorkerState::Uninitialized),
                binding: Mutex::new(None),
                read_failures: AtomicU64::new(0),
            }),
            control: Mutex::new(WorkerControl::default()),
        }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.shared.binding.lock().map(|(backend, _)| backend)
    }

    pub fn index(&self) -> Option<u32> {
        self.shared.binding.lock().map(|(_, index)| index)
    }

    /// Open a session on `backend`. Only valid from `Uninitialized`.
    pub fn open(&self, backend: &dyn CaptureBackend, params: &CaptureParams) -> Result<(), OpenError> {
        let mut control = self.control.lock();
        if self.state() != WorkerState::Uninitialized {
            return Err(OpenError::unavailable(
                params.index,
                format!("{} worker is already {}", self.camera.label(), self.state()),
            ));
        }

        self.shared.set_state(self.camera, WorkerState::Opening);
        match backend.open(params) {
            Ok(session) => {
                control.session = Some(session);
                *self.shared.binding.lock() = Some((backend.kind(), params.index));
                info!(
                    "{} opened on index {} via {}",
                    self.camera.label(),
                    params.index,
                    backend.kind()
                );
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(self.camera, WorkerState::Errored);
                Err(e)
            }
        }
    }

    /// Spawn the capture thread for an opened session
    pub fn start(&self, status: Option<StatusCallback>) -> io::Result<()> {
        let mut control = self.control.lock();
        let session = control.session.take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} has no open session", self.camera.label()),
            )
        })?;

        let (stop_tx, stop_rx) = channel::bounded(1);
        let camera = self.camera;
        let settings = self.settings.clone();
        let shared = Arc::clone(&self.shared);

        self.shared.set_state(camera, WorkerState::Running);
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", camera))
            .spawn(move || {
                #[cfg(test)]
                spawn_log::record(*shared.binding.lock());
                capture_loop(camera, session, settings, shared, stop_rx, status)
            });

        match spawned {
            Ok(handle) => {
                control.handle = Some(handle);
                control.stop_tx = Some(stop_tx);
                Ok(())
            }
            Err(e) => {
                // The closure, and the session in it, were dropped by the failed spawn
                self.shared.set_state(camera, WorkerState::Errored);
                Err(e)
            }
        }
    }

    /// Stop capturing and release the session. Idempotent.
    ///
    /// Returns within roughly one read timeout, since an in-flight read is
    /// allowed to finish.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        let handle = control.handle.take();
        let mut session = control.session.take();
        if handle.is_none() && session.is_none() {
            return;
        }

        if let Some(stop_tx) = control.stop_tx.take() {
            self.shared.set_state(self.camera, WorkerState::Stopping);
            let _ = stop_tx.try_send(());
        }

        if let Some(handle) = handle {
            match handle.join() {
                Ok(returned) => session = Some(returned),
                Err(_) => error!("{} capture thread panicked", self.camera.label()),
            }
        }

        if let Some(mut session) = session {
            session.close();
        }

        self.shared.slot.clear();
        self.shared.set_state(self.camera, WorkerState::Closed);
        info!("{} capture stopped", self.camera.label());
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.slot.latest()
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.state(), WorkerState::Errored | WorkerState::Closed)
            && self.shared.slot.has_frame()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.slot.published()
    }

    pub fn read_failures(&self) -> u64 {
        self.shared.read_failures.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}


fn notify(status: &Option<StatusCallback>, camera: CameraId, update: CameraStatus) {
    let Some(callback) = status else {
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| callback(camera, update))).is_err() {
        error!("Status callback panicked for {}", camera.label());
    }
}

fn capture_loop(
    camera: CameraId,
    mut session: Box<dyn CaptureSession>,
    settings: WorkerSettings,
    shared: Arc<WorkerShared>,
    stop_rx: Receiver<()>,
    status: Option<StatusCallback>,
) -> Box<dyn CaptureSession> {
    info!(
        "{} capture loop started ({:?} interval)",
        camera.label(),
        settings.frame_interval
    );

    // Retries allowed after a failed read; one more failure is fatal
    let failure_limit = settings.max_consecutive_failures;
    let mut consecutive_failures = 0u32;
    let mut announced = false;

    loop {
        let started = Instant::now();
        let pause = match session.read_frame(settings.read_timeout) {
            Ok(frame) => {
                consecutive_failures = 0;
                trace!("{} frame {}", camera.label(), frame.id);
                shared.slot.publish(frame);
                if !announced {
                    announced = true;
                    debug!("{} published its first frame", camera.label());
                    notify(&status, camera, CameraStatus::Ready);
                }
                settings.frame_interval.saturating_sub(started.elapsed())
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                shared.read_failures.fetch_add(1, Ordering::Relaxed);

                if consecutive_failures > failure_limit {
                    error!(
                        "{} failed {} reads in a row, giving up: {}",
                        camera.label(),
                        consecutive_failures,
                        e
                    );
                    shared.slot.clear();
                    shared.set_state(camera, WorkerState::Errored);
                    notify(
                        &status,
                        camera,
                        CameraStatus::Error {
                            reason: e.to_string(),
                        },
                    );
                    break;
                }

                warn!(
                    "{} read failed ({}/{}): {}",
                    camera.label(),
                    consecutive_failures,
                    failure_limit,
                    e
                );
                if !session.is_alive() {
                    debug!("{} session reports it is not alive", camera.label());
                }
                settings.retry_backoff
            }
        };

        match stop_rx.recv_timeout(pause) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("{} capture loop exited", camera.label());
    session
}
