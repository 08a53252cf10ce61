use crate::backend::BackendKind;
use crate::frame::CameraId;
use thiserror::Error;

/// Failure to establish a camera session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("Device {index} unavailable: {details}")]
    DeviceUnavailable { index: u32, details: String },

    #[error("Unsupported mode {width}x{height} on device {index}: {details}")]
    UnsupportedMode {
        index: u32,
        width: u32,
        height: u32,
        details: String,
    },

    #[error("Backend not available on this system: {details}")]
    BackendUnavailable { details: String },
}

impl OpenError {
    pub fn unavailable<S: Into<String>>(index: u32, details: S) -> Self {
        Self::DeviceUnavailable {
            index,
            details: details.into(),
        }
    }
}

/// Failure to read the next frame from an open session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Timed out waiting for a frame after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Camera disconnected: {details}")]
    Disconnected { details: String },

    #[error("Malformed frame from backend: {details}")]
    Malformed { details: String },
}

impl ReadError {
    pub fn disconnected<S: Into<String>>(details: S) -> Self {
        Self::Disconnected {
            details: details.into(),
        }
    }

    pub fn malformed<S: Into<String>>(details: S) -> Self {
        Self::Malformed {
            details: details.into(),
        }
    }
}

/// One failed backend attempt recorded during selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    pub backend: BackendKind,
    pub camera: CameraId,
    pub error: OpenError,
}

impl std::fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.backend, self.camera, self.error)
    }
}

fn format_attempts(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no backend candidates".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Camera manager initialization failure
#[derive(Error, Debug)]
pub enum InitError {
    #[error("No capture backend could open both cameras: {}", format_attempts(.attempts))]
    NoBackendAvailable { attempts: Vec<BackendAttempt> },

    #[error("Camera {failed} failed to start while {opened} was running: {details}")]
    PartialCameraFailure {
        opened: CameraId,
        failed: CameraId,
        details: String,
    },
}

/// Errors raised while analyzing a single frame
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Malformed frame: {details}")]
    MalformedFrame { details: String },

    #[error("Image encoding failed: {details}")]
    Encoding { details: String },
}

impl ProcessingError {
    pub fn malformed<S: Into<String>>(details: S) -> Self {
        Self::MalformedFrame {
            details: details.into(),
        }
    }
}

/// Crate-level error for configuration loading and rendering
#[derive(Error, Debug)]
pub enum NutflixError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, NutflixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_backend_message_lists_attempts() {
        let err = InitError::NoBackendAvailable {
            attempts: vec![
                BackendAttempt {
                    backend: BackendKind::Gstreamer,
                    camera: CameraId::CritterCam,
                    error: OpenError::unavailable(0, "busy"),
                },
                BackendAttempt {
                    backend: BackendKind::LibcameraStill,
                    camera: CameraId::NutCam,
                    error: OpenError::BackendUnavailable {
                        details: "libcamera-still not found".to_string(),
                    },
                },
            ],
        };

        let message = err.to_string();
        assert!(message.contains("gstreamer (critter_cam): Device 0 unavailable: busy"));
        assert!(message.contains("libcamera_still (nut_cam)"));
    }

    #[test]
    fn test_config_error_converts() {
        fn reject() -> Result<()> {
            Err::<(), _>(config::ConfigError::Message("fps must be positive".to_string()))?;
            Ok(())
        }
        let err = reject().unwrap_err();
        assert!(matches!(err, NutflixError::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: fps must be positive"
        );
    }

    #[test]
    fn test_no_backend_message_without_candidates() {
        let err = InitError::NoBackendAvailable { attempts: vec![] };
        assert!(err.to_string().contains("no backend candidates"));
    }
}
