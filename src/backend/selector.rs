//! Backend choice: platform probing, preference ordering, and the symmetric
//! open that binds both cameras to the same backend.

use super::{
    builtin, process, BackendKind, CaptureBackend, CaptureParams, GstreamerBackend,
};
use crate::camera::{CaptureWorker, WorkerSettings};
use crate::config::CamerasConfig;
use crate::error::{BackendAttempt, InitError};
use crate::frame::CameraId;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LIBCAMERA_VID_PATHS: &[&str] = &[
    "/usr/bin/libcamera-vid",
    "/usr/local/bin/libcamera-vid",
    "/usr/bin/rpicam-vid",
];
const LIBCAMERA_STILL_PATHS: &[&str] = &[
    "/usr/bin/libcamera-still",
    "/usr/local/bin/libcamera-still",
    "/usr/bin/rpicam-still",
];

/// What the host looks like, as far as capture is concerned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformSignals {
    pub arch: String,
    pub is_raspberry_pi: bool,
    pub has_libcamera_vid: bool,
    pub has_libcamera_still: bool,
    pub has_video_devices: bool,
    pub gstreamer_compiled: bool,
}

impl PlatformSignals {
    pub fn detect() -> Self {
        let arch = std::env::consts::ARCH.to_string();
        let is_arm = arch.starts_with("arm") || arch == "aarch64";

        let cpuinfo = fs::read_to_string("/proc/cpuinfo")
            .unwrap_or_default()
            .to_lowercase();
        let model = fs::read_to_string("/proc/device-tree/model")
            .unwrap_or_default()
            .to_lowercase();

        let is_raspberry_pi = cpuinfo.contains("raspberry pi")
            || cpuinfo.contains("bcm")
            || model.contains("raspberry pi")
            || (is_arm
                && (Path::new("/opt/vc").exists()
                    || Path::new("/usr/bin/libcamera-hello").exists()));

        let has_video_devices = fs::read_dir("/dev")
            .map(|entries| {
                entries
                    .flatten()
                    .any(|entry| entry.file_name().to_string_lossy().starts_with("video"))
            })
            .unwrap_or(false);

        let signals = Self {
            arch,
            is_raspberry_pi,
            has_libcamera_vid: process::locate_tool(LIBCAMERA_VID_PATHS).is_some(),
            has_libcamera_still: process::locate_tool(LIBCAMERA_STILL_PATHS).is_some(),
            has_video_devices,
            gstreamer_compiled: GstreamerBackend::compiled_in(),
        };
        debug!("Platform signals: {:?}", signals);
        signals
    }
}

/// Orders backend candidates from platform signals and configuration
pub struct BackendSelector;

impl BackendSelector {
    pub fn preference_order(signals: &PlatformSignals, cameras: &CamerasConfig) -> Vec<BackendKind> {
        if let Some(forced) = cameras.forced_backend() {
            return vec![forced];
        }

        let gstreamer = signals.gstreamer_compiled && signals.has_video_devices;
        let mut order = Vec::new();

        if signals.is_raspberry_pi && signals.has_libcamera_vid {
            order.push(BackendKind::LibcameraVid);
            if gstreamer {
                order.push(BackendKind::Gstreamer);
            }
        } else {
            if gstreamer {
                order.push(BackendKind::Gstreamer);
            }
            if signals.has_libcamera_vid {
                order.push(BackendKind::LibcameraVid);
            }
        }
        if signals.has_libcamera_still {
            order.push(BackendKind::LibcameraStill);
        }

        order
    }

    /// Candidate backends for this host, in preference order
    pub fn candidates(cameras: &CamerasConfig) -> Vec<Arc<dyn CaptureBackend>> {
        let signals = PlatformSignals::detect();
        let order = Self::preference_order(&signals, cameras);
        info!(
            "Backend preference: [{}]",
            order
                .iter()
                .map(BackendKind::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        order.into_iter().map(builtin).collect()
    }
}

/// Both cameras opened on one backend, not yet capturing
pub(crate) struct OpenedCameras {
    pub backend: Arc<dyn CaptureBackend>,
    pub critter: CaptureWorker,
    pub nut: CaptureWorker,
}

/// Try candidates in order until one opens both cameras.
///
/// A backend that opens CritterCam but not NutCam has its CritterCam
/// session closed before the next candidate is tried.
pub(crate) fn open_symmetric(
    candidates: &[Arc<dyn CaptureBackend>],
    cameras: &CamerasConfig,
) -> Result<OpenedCameras, InitError> {
    let settings = WorkerSettings::from(cameras);
    let (width, height) = cameras.resolution;
    let params_for = |camera: CameraId| CaptureParams {
        index: cameras.index_for(camera),
        width,
        height,
        fps: cameras.fps,
    };

    let mut attempts = Vec::new();
    for backend in candidates {
        let kind = backend.kind();
        info!("Trying {} backend for both cameras", kind);

        let critter = CaptureWorker::new(CameraId::CritterCam, settings.clone());
        if let Err(error) = critter.open(backend.as_ref(), &params_for(CameraId::CritterCam)) {
            warn!("{} failed to open {}: {}", kind, CameraId::CritterCam.label(), error);
            attempts.push(BackendAttempt {
                backend: kind,
                camera: CameraId::CritterCam,
                error,
            });
            continue;
        }

        let nut = CaptureWorker::new(CameraId::NutCam, settings.clone());
        if let Err(error) = nut.open(backend.as_ref(), &params_for(CameraId::NutCam)) {
            warn!(
                "{} failed to open {}: {}, releasing {}",
                kind,
                CameraId::NutCam.label(),
                error,
                CameraId::CritterCam.label()
            );
            critter.stop();
            attempts.push(BackendAttempt {
                backend: kind,
                camera: CameraId::NutCam,
                error,
            });
            continue;
        }

        info!("Both cameras opened with {} backend", kind);
        return Ok(OpenedCameras {
            backend: Arc::clone(backend),
            critter,
            nut,
        });
    }

    Err(InitError::NoBackendAvailable { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubBackend;
    use crate::config::BackendChoice;
    use crate::error::OpenError;

    fn pi() -> PlatformSignals {
        PlatformSignals {
            arch: "aarch64".to_string(),
            is_raspberry_pi: true,
            has_libcamera_vid: true,
            has_libcamera_still: true,
            has_video_devices: true,
            gstreamer_compiled: true,
        }
    }

    fn desktop() -> PlatformSignals {
        PlatformSignals {
            arch: "x86_64".to_string(),
            is_raspberry_pi: false,
            has_libcamera_vid: false,
            has_libcamera_still: false,
            has_video_devices: true,
            gstreamer_compiled: true,
        }
    }

    #[test]
    fn test_pi_prefers_vendor_stack() {
        let order = BackendSelector::preference_order(&pi(), &CamerasConfig::default());
        assert_eq!(
            order,
            vec![
                BackendKind::LibcameraVid,
                BackendKind::Gstreamer,
                BackendKind::LibcameraStill
            ]
        );
    }

    #[test]
    fn test_desktop_prefers_gstreamer() {
        let order = BackendSelector::preference_order(&desktop(), &CamerasConfig::default());
        assert_eq!(order, vec![BackendKind::Gstreamer]);

        let mut no_devices = desktop();
        no_devices.has_video_devices = false;
        assert!(BackendSelector::preference_order(&no_devices, &CamerasConfig::default()).is_empty());
    }

    #[test]
    fn test_override_yields_single_candidate() {
        let cameras = CamerasConfig {
            backend: BackendChoice::LibcameraStill,
            ..CamerasConfig::default()
        };
        assert_eq!(
            BackendSelector::preference_order(&desktop(), &cameras),
            vec![BackendKind::LibcameraStill]
        );

        let debug = CamerasConfig {
            debug_mode: true,
            ..cameras
        };
        assert_eq!(
            BackendSelector::preference_order(&pi(), &debug),
            vec![BackendKind::TestPattern]
        );
    }

    #[test]
    fn test_symmetric_open_rolls_back_first_camera() {
        let cameras = CamerasConfig::default();
        let flaky = StubBackend::new(BackendKind::Gstreamer).failing_open_for(cameras.nut_cam_id);
        let good = StubBackend::new(BackendKind::LibcameraVid);
        let flaky_counters = flaky.counters();
        let good_counters = good.counters();

        let candidates: Vec<Arc<dyn CaptureBackend>> = vec![Arc::new(flaky), Arc::new(good)];
        let opened = open_symmetric(&candidates, &cameras).unwrap();
        assert_eq!(opened.backend.kind(), BackendKind::LibcameraVid);

        assert_eq!(flaky_counters.opens(), 1);
        assert_eq!(flaky_counters.closes(), 1);
        assert_eq!(flaky_counters.live(), 0);
        assert_eq!(good_counters.live(), 2);

        opened.critter.stop();
        opened.nut.stop();
        assert_eq!(good_counters.live(), 0);
    }

    #[test]
    fn test_all_candidates_failing_reports_attempts() {
        let cameras = CamerasConfig::default();
        let candidates: Vec<Arc<dyn CaptureBackend>> = vec![
            Arc::new(StubBackend::new(BackendKind::Gstreamer).failing_open_for(0)),
            Arc::new(StubBackend::new(BackendKind::LibcameraStill).failing_open_for(1)),
        ];

        match open_symmetric(&candidates, &cameras) {
            Err(InitError::NoBackendAvailable { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].backend, BackendKind::Gstreamer);
                assert_eq!(attempts[0].camera, CameraId::CritterCam);
                assert_eq!(attempts[1].backend, BackendKind::LibcameraStill);
                assert_eq!(attempts[1].camera, CameraId::NutCam);
                assert!(matches!(attempts[1].error, OpenError::DeviceUnavailable { index: 1, .. }));
            }
            _ => panic!("expected NoBackendAvailable"),
        }
    }

    #[test]
    fn test_empty_candidate_list() {
        let result = open_symmetric(&[], &CamerasConfig::default());
        assert!(matches!(
            result,
            Err(InitError::NoBackendAvailable { attempts }) if attempts.is_empty()
        ));
    }
}
