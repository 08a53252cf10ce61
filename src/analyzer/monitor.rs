use super::motion::MotionDetector;
use crate::camera::CameraManager;
use crate::config::MonitorConfig;
use crate::frame::CameraId;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters accumulated by one monitor run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub iterations: u64,
    pub frames_analyzed: HashMap<CameraId, u64>,
    pub motion_detections: HashMap<CameraId, u64>,
}

impl MonitorSummary {
    pub fn frames_analyzed(&self, camera: CameraId) -> u64 {
        self.frames_analyzed.get(&camera).copied().unwrap_or(0)
    }

    pub fn motion_detections(&self, camera: CameraId) -> u64 {
        self.motion_detections.get(&camera).copied().unwrap_or(0)
    }

    fn record(&mut self, camera: CameraId, motion: bool) {
        *self.frames_analyzed.entry(camera).or_insert(0) += 1;
        if motion {
            *self.motion_detections.entry(camera).or_insert(0) += 1;
        }
    }
}

/// Polls both cameras and feeds fresh frames to the motion detector.
///
/// All detector calls happen on the single monitor task, so calls for a
/// camera are serialized.
pub struct HeadlessMonitor {
    cameras: Arc<CameraManager>,
    detector: Arc<RwLock<MotionDetector>>,
    config: MonitorConfig,
    cancel: CancellationToken,
    task: Option<JoinHandle<MonitorSummary>>,
}

impl HeadlessMonitor {
    pub fn new(cameras: Arc<CameraManager>, detector: MotionDetector, config: MonitorConfig) -> Self {
        Self {
            cameras,
            detector: Arc::new(RwLock::new(detector)),
            config,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Shared handle to the detector, for stats queries
    pub fn detector(&self) -> Arc<RwLock<MotionDetector>> {
        Arc::clone(&self.detector)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawn the monitor task. Must be called within a tokio runtime.
    pub fn start(&mut self) {
        if self.task.is_some() {
            warn!("Headless monitor is already running");
            return;
        }

        info!(
            "Starting headless monitor ({}ms interval)",
            self.config.interval_ms
        );
        self.task = Some(tokio::spawn(run_monitor(
            Arc::clone(&self.cameras),
            Arc::clone(&self.detector),
            self.config.clone(),
            self.cancel.clone(),
        )));
    }

    /// Cancel the task, wait for it, and log final per-camera stats
    pub async fn stop(&mut self) -> MonitorSummary {
        let Some(task) = self.task.take() else {
            warn!("Headless monitor is not running");
            return MonitorSummary::default();
        };

        info!("Stopping headless monitor");
        self.cancel.cancel();
        let summary = match task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Headless monitor task failed: {}", e);
                MonitorSummary::default()
            }
        };

        let detector = self.detector.read().await;
        for camera in CameraId::ALL {
            let stats = detector.camera_stats(camera);
            info!(
                "{} final: {} frames processed, {} motion events, {} analyzed by monitor",
                camera.label(),
                stats.frames_processed,
                stats.motion_events_count,
                summary.frames_analyzed(camera)
            );
        }
        summary
    }
}

async fn run_monitor(
    cameras: Arc<CameraManager>,
    detector: Arc<RwLock<MotionDetector>>,
    config: MonitorConfig,
    cancel: CancellationToken,
) -> MonitorSummary {
    info!("Headless monitor task started");

    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_frame_ids: HashMap<CameraId, u64> = HashMap::new();
    let mut summary = MonitorSummary::default();
    let started = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        summary.iterations += 1;

        for camera in CameraId::ALL {
            let Some(frame) = cameras.latest_frame(camera) else {
                continue;
            };
            if last_frame_ids.get(&camera) == Some(&frame.id) {
                continue;
            }
            last_frame_ids.insert(camera, frame.id);

            let detector = Arc::clone(&detector);
            let analysis = tokio::task::spawn_blocking(move || {
                let mut detector = detector.blocking_write();
                let motion = detector.process_frame(&frame, camera);
                (motion, detector.camera_stats(camera))
            })
            .await;

            match analysis {
                Ok((motion, stats)) => {
                    summary.record(camera, motion);
                    if motion {
                        info!(
                            "MOTION DETECTED on {} (events: {}, frames: {})",
                            camera.label(),
                            stats.motion_events_count,
                            stats.frames_processed
                        );
                    }
                }
                Err(e) => error!("Motion analysis failed for {}: {}", camera.label(), e),
            }
        }

        if config.report_every > 0 && summary.iterations % config.report_every == 0 {
            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
            for camera in CameraId::ALL {
                info!(
                    "{}: {:.1} frames/s analyzed, {} motion, available={}",
                    camera.label(),
                    summary.frames_analyzed(camera) as f64 / elapsed,
                    summary.motion_detections(camera),
                    cameras.is_available(camera)
                );
            }
        } else {
            debug!("Monitor iteration {}", summary.iterations);
        }
    }

    info!(
        "Headless monitor task ended after {} iterations",
        summary.iterations
    );
    summary
}
