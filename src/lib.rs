pub mod analyzer;
pub mod backend;
pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;

pub use analyzer::{CameraStats, HeadlessMonitor, MotionDetector, MotionEvent};
pub use backend::{BackendKind, BackendSelector, CaptureBackend, CaptureSession, PlatformSignals};
pub use camera::{CameraManager, CameraStatus, StatusCallback, WorkerState};
pub use config::NutflixConfig;
pub use error::{InitError, NutflixError, OpenError, ProcessingError, ReadError, Result};
pub use frame::{CameraId, Frame, PixelFormat};
