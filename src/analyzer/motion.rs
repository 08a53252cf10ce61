use super::background::{BackgroundModel, FOREGROUND};
use crate::config::MotionConfig;
use crate::error::ProcessingError;
use crate::frame::{CameraId, Frame};

use chrono::{DateTime, Utc};
use image::{GrayImage, Luma};
use imageproc::{
    filter::gaussian_blur_f32,
    region_labelling::{connected_components, Connectivity},
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Motion events kept per camera; the oldest are evicted first
pub const MAX_EVENTS_PER_CAMERA: usize = 100;

/// One detected motion occurrence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionEvent {
    pub camera_id: CameraId,
    pub timestamp: DateTime<Utc>,
    /// Regions that passed the noise floor
    pub contour_count: usize,
    pub largest_contour_area: u32,
    pub total_contour_area: u64,
    pub average_contour_area: f64,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Derived per-camera statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStats {
    pub camera_id: CameraId,
    pub frames_processed: u64,
    pub motion_events_count: usize,
    pub last_motion: Option<DateTime<Utc>>,
    pub last_motion_ago_secs: Option<f64>,
    pub has_background_model: bool,
    pub in_cooldown: bool,
}

/// Connected foreground regions of one mask, after filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSummary {
    pub count: usize,
    pub largest_area: u32,
    pub total_area: u64,
}

impl RegionSummary {
    pub fn is_motion(&self, threshold: u32) -> bool {
        self.count > 0 && self.largest_area >= threshold
    }

    pub fn average_area(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_area as f64 / self.count as f64
        }
    }
}

/// Label 8-connected foreground regions of `mask` and measure them.
///
/// Only the first `max_regions` regions in raster order are inspected, and
/// regions smaller than `min_area` pixels are dropped. Shadow pixels do not
/// count as foreground.
pub fn summarize_regions(mask: &GrayImage, min_area: u32, max_regions: usize) -> RegionSummary {
    let (width, height) = mask.dimensions();
    // Labelling needs at least two pixels; a single pixel is its own region
    if (width as u64) * (height as u64) < 2 {
        let area = mask.pixels().filter(|p| p[0] == FOREGROUND).count() as u32;
        if area == 0 || max_regions == 0 || area < min_area {
            return RegionSummary::default();
        }
        return RegionSummary {
            count: 1,
            largest_area: area,
            total_area: area as u64,
        };
    }

    let mut binary = GrayImage::new(width, height);
    for (out, pixel) in binary.pixels_mut().zip(mask.pixels()) {
        if pixel[0] == FOREGROUND {
            *out = Luma([FOREGROUND]);
        }
    }

    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    let mut order = Vec::new();
    let mut areas: HashMap<u32, u32> = HashMap::new();
    for pixel in labels.pixels() {
        let label = pixel[0];
        if label == 0 {
            continue;
        }
        let area = areas.entry(label).or_insert_with(|| {
            order.push(label);
            0
        });
        *area += 1;
    }

    let mut summary = RegionSummary::default();
    for area in order
        .iter()
        .take(max_regions)
        .filter_map(|label| areas.get(label).copied())
        .filter(|&area| area >= min_area)
    {
        summary.count += 1;
        summary.largest_area = summary.largest_area.max(area);
        summary.total_area += area as u64;
    }
    summary
}

#[derive(Debug, Default)]
struct CameraMotionState {
    model: Option<BackgroundModel>,
    frames_processed: u64,
    last_motion: Option<DateTime<Utc>>,
    events: VecDeque<MotionEvent>,
}

impl CameraMotionState {
    fn in_cooldown(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let Some(last) = self.last_motion else {
            return false;
        };
        match chrono::Duration::from_std(cooldown) {
            Ok(cooldown) => now.signed_duration_since(last) < cooldown,
            Err(_) => true,
        }
    }

    fn record(&mut self, event: MotionEvent) {
        self.last_motion = Some(event.timestamp);
        self.events.push_back(event);
        while self.events.len() > MAX_EVENTS_PER_CAMERA {
            self.events.pop_front();
        }
    }
}

/// Background-subtraction motion detector with per-camera state.
///
/// Calls for the same camera must be serialized by the caller.
pub struct MotionDetector {
    config: MotionConfig,
    cameras: HashMap<CameraId, CameraMotionState>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        info!(
            "Motion detector: threshold={}px, cooldown={}s, sensitivity={}, history={}, shadows={}",
            config.threshold,
            config.cooldown,
            config.sensitivity,
            config.history,
            config.detect_shadows
        );
        Self {
            config,
            cameras: HashMap::new(),
        }
    }

    /// Defaults with a custom area threshold and cooldown (seconds)
    pub fn with_threshold(threshold: u32, cooldown: f64) -> Self {
        Self::new(MotionConfig {
            threshold,
            cooldown,
            ..MotionConfig::default()
        })
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Run detection on `frame` using the wall clock
    pub fn process_frame(&mut self, frame: &Frame, camera: CameraId) -> bool {
        self.process_frame_at(frame, camera, Utc::now())
    }

    /// Run detection on `frame` as if it arrived at `now`. Errors count as no motion.
    pub fn process_frame_at(&mut self, frame: &Frame, camera: CameraId, now: DateTime<Utc>) -> bool {
        match self.detect(frame, camera, now) {
            Ok(detected) => detected,
            Err(e) => {
                error!(
                    "Motion detection failed for {} frame {}: {}",
                    camera.label(),
                    frame.id,
                    e
                );
                false
            }
        }
    }

    fn detect(
        &mut self,
        frame: &Frame,
        camera: CameraId,
        now: DateTime<Utc>,
    ) -> Result<bool, ProcessingError> {
        let config = &self.config;
        let state = self.cameras.entry(camera).or_insert_with(|| {
            debug!("Tracking motion for {}", camera.label());
            CameraMotionState::default()
        });
        state.frames_processed += 1;

        if state.in_cooldown(now, config.cooldown_duration()) {
            trace!("{} in cooldown, skipping frame {}", camera.label(), frame.id);
            return Ok(false);
        }

        let gray = frame.to_gray()?;
        let blurred = gaussian_blur_f32(&gray, config.effective_blur_sigma());

        let model = state
            .model
            .get_or_insert_with(|| BackgroundModel::from_config(config));
        let mask = model.apply(&blurred);

        let regions = summarize_regions(&mask, config.min_contour_area, config.max_contours);
        if !regions.is_motion(config.threshold) {
            trace!(
                "{} frame {}: largest region {}px below {}px",
                camera.label(),
                frame.id,
                regions.largest_area,
                config.threshold
            );
            return Ok(false);
        }

        let event = MotionEvent {
            camera_id: camera,
            timestamp: now,
            contour_count: regions.count,
            largest_contour_area: regions.largest_area,
            total_contour_area: regions.total_area,
            average_contour_area: regions.average_area(),
            frame_width: frame.width,
            frame_height: frame.height,
        };
        info!(
            "Motion on {}: {} regions, largest {}px, total {}px, average {:.1}px",
            camera.label(),
            event.contour_count,
            event.largest_contour_area,
            event.total_contour_area,
            event.average_contour_area
        );
        state.record(event);

        Ok(true)
    }

    pub fn camera_stats(&self, camera: CameraId) -> CameraStats {
        self.camera_stats_at(camera, Utc::now())
    }

    pub fn camera_stats_at(&self, camera: CameraId, now: DateTime<Utc>) -> CameraStats {
        let cooldown = self.config.cooldown_duration();
        match self.cameras.get(&camera) {
            Some(state) => CameraStats {
                camera_id: camera,
                frames_processed: state.frames_processed,
                motion_events_count: state.events.len(),
                last_motion: state.last_motion,
                last_motion_ago_secs: state.last_motion.map(|last| {
                    now.signed_duration_since(last).num_milliseconds() as f64 / 1000.0
                }),
                has_background_model: state.model.is_some(),
                in_cooldown: state.in_cooldown(now, cooldown),
            },
            None => CameraStats {
                camera_id: camera,
                frames_processed: 0,
                motion_events_count: 0,
                last_motion: None,
                last_motion_ago_secs: None,
                has_background_model: false,
                in_cooldown: false,
            },
        }
    }

    /// Logged events for a camera, oldest first, optionally from `since` on
    pub fn get_motion_events(
        &self,
        camera: CameraId,
        since: Option<DateTime<Utc>>,
    ) -> Vec<MotionEvent> {
        self.cameras
            .get(&camera)
            .map(|state| {
                state
                    .events
                    .iter()
                    .filter(|event| since.map_or(true, |since| event.timestamp >= since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn was_motion_detected(&self, camera: CameraId, within: Duration) -> bool {
        self.was_motion_detected_at(camera, within, Utc::now())
    }

    pub fn was_motion_detected_at(
        &self,
        camera: CameraId,
        within: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = self.cameras.get(&camera).and_then(|state| state.last_motion) else {
            return false;
        };
        match chrono::Duration::from_std(within) {
            Ok(within) => now.signed_duration_since(last) <= within,
            Err(_) => true,
        }
    }

    /// Forget the camera's model, counters and events
    pub fn reset(&mut self, camera: CameraId) {
        if self.cameras.remove(&camera).is_some() {
            info!("Reset motion state for {}", camera.label());
        }
    }

    pub fn reset_all(&mut self) {
        self.cameras.clear();
        info!("Reset motion state for all cameras");
    }

    /// Replace the configuration. Background models are rebuilt lazily with
    /// the new parameters; counters and events are kept.
    pub fn update_config(&mut self, config: MotionConfig) {
        info!("Updating motion detection configuration");
        self.config = config;
        for state in self.cameras.values_mut() {
            state.model = None;
        }
    }
}
