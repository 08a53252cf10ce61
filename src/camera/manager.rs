use super::worker::{CaptureWorker, StatusCallback, WorkerState};
use crate::backend::{open_symmetric, BackendKind, BackendSelector, CaptureBackend};
use crate::config::CamerasConfig;
use crate::error::InitError;
use crate::frame::{CameraId, Frame};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-camera snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    pub camera: CameraId,
    pub index: u32,
    pub backend: BackendKind,
    pub state: WorkerState,
    pub available: bool,
    pub frames_captured: u64,
    pub read_failures: u64,
}

/// Owns both capture workers, bound to a single backend.
///
/// Safe to share across threads; every accessor takes `&self`.
pub struct CameraManager {
    config: CamerasConfig,
    backend: Arc<dyn CaptureBackend>,
    critter: CaptureWorker,
    nut: CaptureWorker,
    shut_down: AtomicBool,
}

impl CameraManager {
    /// Detect the platform, pick a backend and start both cameras
    pub fn initialize(
        config: &CamerasConfig,
        status: Option<StatusCallback>,
    ) -> Result<Self, InitError> {
        let candidates = BackendSelector::candidates(config);
        Self::initialize_with(config, &candidates, status)
    }

    /// Start both cameras on the first candidate that can open them
    pub fn initialize_with(
        config: &CamerasConfig,
        candidates: &[Arc<dyn CaptureBackend>],
        status: Option<StatusCallback>,
    ) -> Result<Self, InitError> {
        let opened = open_symmetric(candidates, config)?;
        let manager = Self {
            config: config.clone(),
            backend: opened.backend,
            critter: opened.critter,
            nut: opened.nut,
            shut_down: AtomicBool::new(false),
        };

        for camera in CameraId::ALL {
            if let Err(e) = manager.worker(camera).start(status.clone()) {
                let other = match camera {
                    CameraId::CritterCam => CameraId::NutCam,
                    CameraId::NutCam => CameraId::CritterCam,
                };
                warn!("{} capture thread failed to start: {}", camera.label(), e);
                manager.shutdown();
                return Err(InitError::PartialCameraFailure {
                    opened: other,
                    failed: camera,
                    details: e.to_string(),
                });
            }
        }

        info!(
            "Camera manager running with {} backend (critter_cam={}, nut_cam={}, {}x{} @ {}fps)",
            manager.backend.kind(),
            config.critter_cam_id,
            config.nut_cam_id,
            config.resolution.0,
            config.resolution.1,
            config.fps
        );
        Ok(manager)
    }

    fn worker(&self, camera: CameraId) -> &CaptureWorker {
        match camera {
            CameraId::CritterCam => &self.critter,
            CameraId::NutCam => &self.nut,
        }
    }

    /// Most recent frame, or `None` before the first frame and after errors or shutdown
    pub fn latest_frame(&self, camera: CameraId) -> Option<Frame> {
        self.worker(camera).latest_frame()
    }

    /// Most recent frame as JPEG
    pub fn latest_frame_encoded(&self, camera: CameraId, quality: u8) -> Option<Bytes> {
        let frame = self.latest_frame(camera)?;
        match frame.encode_jpeg(quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("Failed to encode {} frame {}: {}", camera.label(), frame.id, e);
                None
            }
        }
    }

    /// Most recent frame as JPEG at the configured quality
    pub fn latest_jpeg(&self, camera: CameraId) -> Option<Bytes> {
        self.latest_frame_encoded(camera, self.config.jpeg_quality)
    }

    pub fn is_available(&self, camera: CameraId) -> bool {
        self.worker(camera).is_available()
    }

    pub fn frame_count(&self, camera: CameraId) -> u64 {
        self.worker(camera).frames_captured()
    }

    pub fn worker_state(&self, camera: CameraId) -> WorkerState {
        self.worker(camera).state()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn camera_info(&self) -> Vec<CameraInfo> {
        CameraId::ALL
            .iter()
            .map(|&camera| {
                let worker = self.worker(camera);
                CameraInfo {
                    camera,
                    index: worker
                        .index()
                        .unwrap_or_else(|| self.config.index_for(camera)),
                    backend: self.backend.kind(),
                    state: worker.state(),
                    available: worker.is_available(),
                    frames_captured: worker.frames_captured(),
                    read_failures: worker.read_failures(),
                }
            })
            .collect()
    }

    /// Stop both workers and release every session. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down cameras");
        for camera in CameraId::ALL {
            self.worker(camera).stop();
        }
        info!("Cameras released");
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
