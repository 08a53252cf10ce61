use crate::backend::BackendKind;
use crate::frame::CameraId;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NutflixConfig {
    pub cameras: CamerasConfig,
    pub motion_detection: MotionConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

/// Which capture backend to bind
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    /// Pick from platform detection
    Auto,
    Gstreamer,
    LibcameraVid,
    LibcameraStill,
    TestPattern,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CamerasConfig {
    /// Camera index for CritterCam
    #[serde(default = "default_critter_cam_id")]
    pub critter_cam_id: u32,

    /// Camera index for NutCam
    #[serde(default = "default_nut_cam_id")]
    pub nut_cam_id: u32,

    /// Requested resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Capture pacing target per camera
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Backend override, `auto` to follow platform detection
    #[serde(default = "default_backend")]
    pub backend: BackendChoice,

    /// Use synthetic test-pattern cameras
    #[serde(default)]
    pub debug_mode: bool,

    /// Upper bound on a single frame read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Pause after a failed read before retrying
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Retries after a failed read; the camera is marked errored once exceeded
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// JPEG quality used for encoded frames
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl CamerasConfig {
    pub fn index_for(&self, camera: CameraId) -> u32 {
        match camera {
            CameraId::CritterCam => self.critter_cam_id,
            CameraId::NutCam => self.nut_cam_id,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Backend forced by configuration, if any. Debug mode wins over `backend`.
    pub fn forced_backend(&self) -> Option<BackendKind> {
        if self.debug_mode {
            return Some(BackendKind::TestPattern);
        }
        match self.backend {
            BackendChoice::Auto => None,
            BackendChoice::Gstreamer => Some(BackendKind::Gstreamer),
            BackendChoice::LibcameraVid => Some(BackendKind::LibcameraVid),
            BackendChoice::LibcameraStill => Some(BackendKind::LibcameraStill),
            BackendChoice::TestPattern => Some(BackendKind::TestPattern),
        }
    }
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            critter_cam_id: default_critter_cam_id(),
            nut_cam_id: default_nut_cam_id(),
            resolution: default_camera_resolution(),
            fps: default_camera_fps(),
            backend: default_backend(),
            debug_mode: false,
            read_timeout_ms: default_read_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

/// Motion detection parameters. Model parameters are fixed when a camera's
/// background model is created.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MotionConfig {
    /// Minimum region area (pixels) that counts as motion
    #[serde(default = "default_motion_threshold")]
    pub threshold: u32,

    /// Background model variance threshold
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,

    /// Seconds between motion events for the same camera
    #[serde(default = "default_cooldown")]
    pub cooldown: f64,

    /// Gaussian smoothing kernel size (odd)
    #[serde(default = "default_blur_kernel_size")]
    pub blur_kernel_size: u32,

    /// Gaussian sigma, 0 derives it from the kernel size
    #[serde(default)]
    pub blur_sigma: f32,

    /// Frames of scene history the background model averages over
    #[serde(default = "default_history")]
    pub history: u32,

    /// Classify darkened background as shadow instead of foreground
    #[serde(default = "default_detect_shadows")]
    pub detect_shadows: bool,

    /// Regions smaller than this are treated as noise
    #[serde(default = "default_min_contour_area")]
    pub min_contour_area: u32,

    /// Cap on regions inspected per frame
    #[serde(default = "default_max_contours")]
    pub max_contours: usize,
}

impl MotionConfig {
    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown.max(0.0))
    }

    /// Effective Gaussian sigma, using the usual kernel-size rule when unset
    pub fn effective_blur_sigma(&self) -> f32 {
        if self.blur_sigma > 0.0 {
            self.blur_sigma
        } else {
            0.3 * ((self.blur_kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: default_motion_threshold(),
            sensitivity: default_sensitivity(),
            cooldown: default_cooldown(),
            blur_kernel_size: default_blur_kernel_size(),
            blur_sigma: 0.0,
            history: default_history(),
            detect_shadows: default_detect_shadows(),
            min_contour_area: default_min_contour_area(),
            max_contours: default_max_contours(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Period of the headless monitor loop
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    /// Log throughput every N iterations
    #[serde(default = "default_report_every")]
    pub report_every: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            report_every: default_report_every(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file, written through a non-blocking appender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default = "default_file_level")]
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            file_level: default_file_level(),
        }
    }
}

impl NutflixConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("nutflix.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("cameras.critter_cam_id", default_critter_cam_id())?
            .set_default("cameras.nut_cam_id", default_nut_cam_id())?
            .set_default(
                "cameras.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("cameras.fps", default_camera_fps())?
            .set_default("cameras.backend", "auto")?
            .set_default("cameras.debug_mode", false)?
            .set_default("cameras.read_timeout_ms", default_read_timeout_ms())?
            .set_default("cameras.retry_backoff_ms", default_retry_backoff_ms())?
            .set_default(
                "cameras.max_consecutive_failures",
                default_max_consecutive_failures(),
            )?
            .set_default("cameras.jpeg_quality", default_jpeg_quality() as u32)?
            .set_default("motion_detection.threshold", default_motion_threshold())?
            .set_default("motion_detection.sensitivity", default_sensitivity() as f64)?
            .set_default("motion_detection.cooldown", default_cooldown())?
            .set_default(
                "motion_detection.blur_kernel_size",
                default_blur_kernel_size(),
            )?
            .set_default("motion_detection.blur_sigma", 0.0)?
            .set_default("motion_detection.history", default_history())?
            .set_default("motion_detection.detect_shadows", default_detect_shadows())?
            .set_default(
                "motion_detection.min_contour_area",
                default_min_contour_area(),
            )?
            .set_default(
                "motion_detection.max_contours",
                default_max_contours() as i64,
            )?
            .set_default("monitor.interval_ms", default_monitor_interval_ms())?
            .set_default("monitor.report_every", default_report_every())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .set_default("logging.file_level", default_file_level())?
            // Optional file; format follows the extension (toml, yaml, json)
            .add_source(File::with_name(&path_str).required(false))
            // NUTFLIX_CAMERAS__FPS=15 style overrides
            .add_source(
                Environment::with_prefix("NUTFLIX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: NutflixConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cameras = &self.cameras;
        if cameras.resolution.0 == 0 || cameras.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if cameras.fps == 0 {
            return Err(ConfigError::Message(
                "Camera fps must be greater than 0".to_string(),
            ));
        }

        if cameras.critter_cam_id == cameras.nut_cam_id {
            return Err(ConfigError::Message(format!(
                "critter_cam_id and nut_cam_id must differ (both are {})",
                cameras.critter_cam_id
            )));
        }

        if cameras.read_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Camera read_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !(1..=100).contains(&cameras.jpeg_quality) {
            return Err(ConfigError::Message(
                "Camera jpeg_quality must be between 1 and 100".to_string(),
            ));
        }

        let motion = &self.motion_detection;
        if motion.blur_kernel_size == 0 || motion.blur_kernel_size % 2 == 0 {
            return Err(ConfigError::Message(
                "Motion blur_kernel_size must be a positive odd number".to_string(),
            ));
        }

        if motion.history == 0 {
            return Err(ConfigError::Message(
                "Motion history must be greater than 0".to_string(),
            ));
        }

        if motion.sensitivity <= 0.0 {
            return Err(ConfigError::Message(
                "Motion sensitivity must be positive".to_string(),
            ));
        }

        if motion.cooldown < 0.0 {
            return Err(ConfigError::Message(
                "Motion cooldown must not be negative".to_string(),
            ));
        }

        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::Message(
                "Monitor interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load from `path`, then validate
    pub fn load_validated<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rendered as TOML
    pub fn default_toml() -> crate::Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}

impl Default for NutflixConfig {
    fn default() -> Self {
        Self {
            cameras: CamerasConfig::default(),
            motion_detection: MotionConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Default value functions
fn default_critter_cam_id() -> u32 {
    0
}
fn default_nut_cam_id() -> u32 {
    1
}
fn default_camera_resolution() -> (u32, u32) {
    (640, 480)
}
fn default_camera_fps() -> u32 {
    10
}
fn default_backend() -> BackendChoice {
    BackendChoice::Auto
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_max_consecutive_failures() -> u32 {
    25
}
fn default_jpeg_quality() -> u8 {
    80
}

fn default_motion_threshold() -> u32 {
    500
}
fn default_sensitivity() -> f32 {
    16.0
}
fn default_cooldown() -> f64 {
    2.0
}
fn default_blur_kernel_size() -> u32 {
    21
}
fn default_history() -> u32 {
    500
}
fn default_detect_shadows() -> bool {
    true
}
fn default_min_contour_area() -> u32 {
    100
}
fn default_max_contours() -> usize {
    50
}

fn default_monitor_interval_ms() -> u64 {
    33
}
fn default_report_every() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_file_level() -> String {
    "debug".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = NutflixConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cameras.index_for(CameraId::CritterCam), 0);
        assert_eq!(config.cameras.index_for(CameraId::NutCam), 1);
        assert_eq!(config.motion_detection.threshold, 500);
        assert_eq!(config.motion_detection.cooldown_duration(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[cameras]\ncritter_cam_id = 2\nnut_cam_id = 3\nbackend = \"libcamera_still\"\n\n[motion_detection]\nthreshold = 800\ncooldown = 0.5"
        )
        .unwrap();

        let config = NutflixConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.cameras.critter_cam_id, 2);
        assert_eq!(config.cameras.nut_cam_id, 3);
        assert_eq!(config.cameras.backend, BackendChoice::LibcameraStill);
        assert_eq!(config.cameras.resolution, (640, 480));
        assert_eq!(config.motion_detection.threshold, 800);
        assert_eq!(config.motion_detection.history, 500);
        assert!(config.motion_detection.detect_shadows);
        assert_eq!(config.logging.file, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NutflixConfig::load_from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cameras.fps, 10);
        assert_eq!(config.cameras.backend, BackendChoice::Auto);
    }

    #[test]
    fn test_load_validated_rejects_shared_index() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[cameras]\ncritter_cam_id = 1\nnut_cam_id = 1").unwrap();

        match NutflixConfig::load_validated(file.path()) {
            Err(crate::error::NutflixError::Config(e)) => {
                assert!(e.to_string().contains("must differ"))
            }
            other => panic!("expected a config error, got {:?}", other.map(|_| ())),
        }

        let dir = tempfile::tempdir().unwrap();
        assert!(NutflixConfig::load_validated(dir.path().join("absent.toml")).is_ok());
    }

    #[test]
    fn test_forced_backend() {
        let mut cameras = CamerasConfig::default();
        assert_eq!(cameras.forced_backend(), None);

        cameras.backend = BackendChoice::Gstreamer;
        assert_eq!(cameras.forced_backend(), Some(BackendKind::Gstreamer));

        cameras.debug_mode = true;
        assert_eq!(cameras.forced_backend(), Some(BackendKind::TestPattern));
    }

    #[test]
    fn test_config_validation() {
        let mut config = NutflixConfig::default();
        config.cameras.nut_cam_id = config.cameras.critter_cam_id;
        assert!(config.validate().is_err());

        config.cameras.nut_cam_id = 1;
        config.motion_detection.blur_kernel_size = 20;
        assert!(config.validate().is_err());

        config.motion_detection.blur_kernel_size = 21;
        config.cameras.jpeg_quality = 0;
        assert!(config.validate().is_err());

        config.cameras.jpeg_quality = 90;
        config.cameras.resolution = (0, 480);
        assert!(config.validate().is_err());

        config.cameras.resolution = (640, 480);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blur_sigma_derived_from_kernel() {
        let config = MotionConfig::default();
        assert!((config.effective_blur_sigma() - 3.5).abs() < 1e-6);

        let explicit = MotionConfig {
            blur_sigma: 1.5,
            ..MotionConfig::default()
        };
        assert_eq!(explicit.effective_blur_sigma(), 1.5);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = NutflixConfig::default_toml().unwrap();
        assert!(rendered.contains("[motion_detection]"));
        let parsed: NutflixConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, NutflixConfig::default());
    }
}
