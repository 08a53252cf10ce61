//! Concurrent capture for the two feeder cameras.

mod manager;
mod slot;
mod worker;

pub use manager::{CameraInfo, CameraManager};
pub use slot::LatestFrameSlot;
pub use worker::{CameraStatus, CaptureWorker, StatusCallback, WorkerSettings, WorkerState};
