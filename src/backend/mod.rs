//! Capture backends.
//!
//! A [`CaptureBackend`] is a capability that can open camera sessions; the
//! [`CaptureSession`] it returns owns the underlying device, pipeline or
//! subprocess. Every session hands out frames already normalized to packed RGB.

mod gstreamer;
mod libcamera_still;
mod libcamera_vid;
mod process;
mod selector;
#[cfg(test)]
pub(crate) mod stub;
mod test_pattern;

use crate::error::{OpenError, ReadError};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use self::gstreamer::GstreamerBackend;
pub use libcamera_still::LibcameraStillBackend;
pub use libcamera_vid::LibcameraVidBackend;
pub use selector::{BackendSelector, PlatformSignals};
pub(crate) use selector::open_symmetric;
pub use test_pattern::TestPatternBackend;

/// The capture mechanisms a session can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// GStreamer v4l2 frame grabber
    Gstreamer,
    /// libcamera-vid streaming raw YUV over a pipe
    LibcameraVid,
    /// One libcamera-still invocation per frame
    LibcameraStill,
    /// Synthetic frames for development without cameras
    TestPattern,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Gstreamer => "gstreamer",
            BackendKind::LibcameraVid => "libcamera_vid",
            BackendKind::LibcameraStill => "libcamera_still",
            BackendKind::TestPattern => "test_pattern",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a camera session is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParams {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A capture mechanism able to open sessions on camera indices
pub trait CaptureBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Claim the camera and start producing frames
    fn open(&self, params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError>;
}

/// An open camera session, exclusively owned by one capture worker
pub trait CaptureSession: Send {
    /// Wait at most `timeout` for the next frame, returned as RGB24
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, ReadError>;

    /// Non-blocking liveness probe
    fn is_alive(&self) -> bool;

    /// Release every underlying resource. Safe to call more than once.
    fn close(&mut self);
}

/// Construct the built-in implementation of a backend kind
pub fn builtin(kind: BackendKind) -> Arc<dyn CaptureBackend> {
    match kind {
        BackendKind::Gstreamer => Arc::new(GstreamerBackend::new()),
        BackendKind::LibcameraVid => Arc::new(LibcameraVidBackend::new()),
        BackendKind::LibcameraStill => Arc::new(LibcameraStillBackend::new()),
        BackendKind::TestPattern => Arc::new(TestPatternBackend::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_match() {
        for kind in [
            BackendKind::Gstreamer,
            BackendKind::LibcameraVid,
            BackendKind::LibcameraStill,
            BackendKind::TestPattern,
        ] {
            assert_eq!(builtin(kind).kind(), kind);
        }
    }

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::LibcameraVid.to_string(), "libcamera_vid");
        let json = serde_json::to_string(&BackendKind::TestPattern).unwrap();
        assert_eq!(json, "\"test_pattern\"");
    }
}
