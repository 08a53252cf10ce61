use super::process::{self, CaptureCommand, TERMINATE_GRACE};
use super::{BackendKind, CaptureBackend, CaptureParams, CaptureSession};
use crate::error::{OpenError, ReadError};
use crate::frame::{Frame, PixelFormat};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOOL_CANDIDATES: &[&str] = &[
    "/usr/bin/libcamera-still",
    "/usr/local/bin/libcamera-still",
    "/usr/bin/rpicam-still",
];

/// Sensor settle time for the probe capture at open
const PROBE_SETTLE_MS: u64 = 1000;
/// Sensor settle time for each regular capture
const CAPTURE_SETTLE_MS: u64 = 100;
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Captures each frame with a separate `libcamera-still` invocation.
///
/// Slow, but works on stacks where the camera cannot be streamed.
pub struct LibcameraStillBackend {
    program: Option<PathBuf>,
    scratch_dir: PathBuf,
}

impl LibcameraStillBackend {
    pub fn new() -> Self {
        Self {
            program: process::locate_tool(TOOL_CANDIDATES),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_program<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: Some(program.into()),
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl Default for LibcameraStillBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for LibcameraStillBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LibcameraStill
    }

    fn open(&self, params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError> {
        let program = self
            .program
            .clone()
            .ok_or_else(|| OpenError::BackendUnavailable {
                details: "libcamera-still not found".to_string(),
            })?;

        let mut session = LibcameraStillSession {
            params: *params,
            program,
            scratch_dir: self.scratch_dir.clone(),
            sequence: 0,
            closed: false,
        };

        // A probe capture proves the camera answers before we claim it
        session
            .capture(PROBE_SETTLE_MS, PROBE_DEADLINE)
            .map_err(|e| OpenError::unavailable(params.index, format!("probe capture failed: {}", e)))?;

        info!(
            "libcamera-still ready on camera {} at {}x{}",
            params.index, params.width, params.height
        );
        Ok(Box::new(session))
    }
}

struct LibcameraStillSession {
    params: CaptureParams,
    program: PathBuf,
    scratch_dir: PathBuf,
    sequence: u64,
    closed: bool,
}

impl LibcameraStillSession {
    fn scratch_file(&self) -> PathBuf {
        self.scratch_dir.join(format!(
            "nutflix-cam{}-{}.jpg",
            self.params.index,
            Uuid::new_v4()
        ))
    }

    fn command(&self, output: &Path, settle_ms: u64) -> CaptureCommand {
        CaptureCommand::new(&self.program)
            .arg("--camera")
            .arg(self.params.index)
            .arg("--width")
            .arg(self.params.width)
            .arg("--height")
            .arg(self.params.height)
            .arg("--timeout")
            .arg(settle_ms)
            .arg("--nopreview")
            .arg("--encoding")
            .arg("jpg")
            .arg("--output")
            .arg(output.display())
    }

    fn capture(&mut self, settle_ms: u64, limit: Duration) -> Result<Frame, ReadError> {
        let output = self.scratch_file();
        let result = self.capture_into(&output, settle_ms, limit);
        if output.exists() {
            if let Err(e) = fs::remove_file(&output) {
                warn!("Failed to remove scratch file {}: {}", output.display(), e);
            }
        }
        result
    }

    fn capture_into(
        &mut self,
        output: &Path,
        settle_ms: u64,
        limit: Duration,
    ) -> Result<Frame, ReadError> {
        let mut child = self
            .command(output, settle_ms)
            .spawn(Stdio::null())
            .map_err(|e| ReadError::disconnected(format!("spawn failed: {}", e)))?;

        let status = process::wait_until(&mut child, Instant::now() + limit)
            .map_err(|e| ReadError::disconnected(format!("wait failed: {}", e)))?;

        let Some(status) = status else {
            process::terminate(&mut child, TERMINATE_GRACE);
            return Err(ReadError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            });
        };

        if !status.success() {
            return Err(ReadError::disconnected(format!(
                "libcamera-still exited with {}: {}",
                status,
                process::read_stderr(&mut child)
            )));
        }

        let jpeg = fs::read(output)
            .map_err(|e| ReadError::malformed(format!("no image written: {}", e)))?;
        let frame = Frame::new(
            self.sequence,
            SystemTime::now(),
            jpeg,
            self.params.width,
            self.params.height,
            PixelFormat::Jpeg,
        );
        self.sequence += 1;
        frame.into_rgb()
    }
}

impl CaptureSession for LibcameraStillSession {
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, ReadError> {
        if self.closed {
            return Err(ReadError::disconnected("session closed"));
        }
        self.capture(CAPTURE_SETTLE_MS, timeout)
    }

    fn is_alive(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("libcamera-still session for camera {} closed", self.params.index);
        }
    }
}

impl Drop for LibcameraStillSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn params() -> CaptureParams {
        CaptureParams {
            index: 1,
            width: 16,
            height: 8,
            fps: 10,
        }
    }

    /// Writes a fake capture tool that copies `jpeg` to its `--output` argument
    fn fake_tool(dir: &Path, jpeg: &Path) -> PathBuf {
        let script = dir.join("fake-still");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"--output\" ]; then cp '{}' \"$2\"; fi\n  shift\ndone\n",
                jpeg.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn test_missing_tool_is_backend_unavailable() {
        let backend = LibcameraStillBackend {
            program: None,
            scratch_dir: std::env::temp_dir(),
        };
        assert!(matches!(
            backend.open(&params()),
            Err(OpenError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn test_failing_probe_fails_open() {
        let backend = LibcameraStillBackend::with_program("/bin/false");
        assert!(matches!(
            backend.open(&params()),
            Err(OpenError::DeviceUnavailable { index: 1, .. })
        ));
    }

    #[test]
    fn test_capture_decodes_jpeg_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let jpeg = dir.path().join("sample.jpg");
        let encoded = Frame::rgb(0, 16, 8, vec![120u8; 16 * 8 * 3])
            .encode_jpeg(90)
            .unwrap();
        fs::write(&jpeg, &encoded).unwrap();

        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        let backend = LibcameraStillBackend {
            program: Some(fake_tool(dir.path(), &jpeg)),
            scratch_dir: scratch.clone(),
        };

        let mut session = backend.open(&params()).unwrap();
        let frame = session.read_frame(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.format, PixelFormat::Rgb24);
        assert_eq!(frame.dimensions(), (16, 8));
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);

        session.close();
        session.close();
        assert!(!session.is_alive());
        assert!(session.read_frame(Duration::from_secs(1)).is_err());
    }
}
