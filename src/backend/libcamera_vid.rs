use super::process::{self, CaptureCommand, StderrTail, TERMINATE_GRACE};
use super::{BackendKind, CaptureBackend, CaptureParams, CaptureSession};
use crate::error::{OpenError, ReadError};
use crate::frame::{Frame, PixelFormat};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TrySendError};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

const TOOL_CANDIDATES: &[&str] = &[
    "/usr/bin/libcamera-vid",
    "/usr/local/bin/libcamera-vid",
    "/usr/bin/rpicam-vid",
];

/// How long the tool gets to fail before the session counts as open
const STARTUP_GRACE: Duration = Duration::from_millis(1500);

/// Streams raw I420 frames from `libcamera-vid` over a pipe
pub struct LibcameraVidBackend {
    program: Option<PathBuf>,
}

impl LibcameraVidBackend {
    pub fn new() -> Self {
        Self {
            program: process::locate_tool(TOOL_CANDIDATES),
        }
    }

    /// Use a specific executable instead of searching the usual locations
    pub fn with_program<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn command(program: &PathBuf, params: &CaptureParams) -> CaptureCommand {
        CaptureCommand::new(program)
            .arg("--camera")
            .arg(params.index)
            .arg("--width")
            .arg(params.width)
            .arg("--height")
            .arg(params.height)
            .arg("--framerate")
            .arg(params.fps.max(1))
            .arg("--codec")
            .arg("yuv420")
            .arg("--timeout")
            .arg(0)
            .arg("--nopreview")
            .arg("--flush")
            .arg("--output")
            .arg("-")
    }
}

impl Default for LibcameraVidBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for LibcameraVidBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LibcameraVid
    }

    fn open(&self, params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| OpenError::BackendUnavailable {
                details: "libcamera-vid not found".to_string(),
            })?;

        let frame_size = PixelFormat::I420
            .expected_size(params.width, params.height)
            .unwrap_or_default();
        if frame_size == 0 || params.width % 2 != 0 || params.height % 2 != 0 {
            return Err(OpenError::UnsupportedMode {
                index: params.index,
                width: params.width,
                height: params.height,
                details: "I420 streaming needs non-zero even dimensions".to_string(),
            });
        }

        let mut child = Self::command(program, params)
            .spawn(Stdio::piped())
            .map_err(|e| OpenError::unavailable(params.index, format!("spawn failed: {}", e)))?;
        let label = format!("libcamera-vid-{}", params.index);
        let stderr = StderrTail::capture(&mut child, &label);

        let mut session =
            LibcameraVidSession::start(*params, child, stderr, |stdout, tx, drain| {
                thread::Builder::new()
                    .name(label.clone())
                    .spawn(move || pump_frames(stdout, frame_size, tx, drain))
            })?;

        // Wait for either the first frame or an early exit
        let deadline = Instant::now() + STARTUP_GRACE;
        while Instant::now() < deadline && session.frames.is_empty() {
            if session.exited() {
                let details = session.stderr.text();
                let unsupported = session.stderr.mentions("unsupported")
                    || session.stderr.mentions("invalid");
                session.close();
                return Err(if unsupported {
                    OpenError::UnsupportedMode {
                        index: params.index,
                        width: params.width,
                        height: params.height,
                        details,
                    }
                } else {
                    OpenError::unavailable(params.index, details)
                });
            }
            thread::sleep(Duration::from_millis(50));
        }

        info!(
            "libcamera-vid streaming camera {} at {}x{}@{}fps",
            params.index, params.width, params.height, params.fps
        );
        Ok(Box::new(session))
    }
}

fn pump_frames(
    mut stdout: ChildStdout,
    frame_size: usize,
    tx: channel::Sender<Vec<u8>>,
    drain: Receiver<Vec<u8>>,
) {
    loop {
        let mut buf = vec![0u8; frame_size];
        if let Err(e) = stdout.read_exact(&mut buf) {
            debug!("libcamera-vid stream ended: {}", e);
            return;
        }
        match tx.try_send(buf) {
            Ok(()) => {}
            Err(TrySendError::Full(buf)) => {
                let _ = drain.try_recv();
                if tx.try_send(buf).is_err() {
                    debug!("Dropped frame, consumer is behind");
                }
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

struct LibcameraVidSession {
    params: CaptureParams,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    frames: Receiver<Vec<u8>>,
    stderr: StderrTail,
    sequence: u64,
}

impl LibcameraVidSession {
    /// Wrap a spawned tool and start its frame reader. The session owns the
    /// child before anything else can fail, so every error path terminates it.
    fn start<F>(
        params: CaptureParams,
        child: Child,
        stderr: StderrTail,
        spawn_reader: F,
    ) -> Result<Self, OpenError>
    where
        F: FnOnce(
            ChildStdout,
            channel::Sender<Vec<u8>>,
            Receiver<Vec<u8>>,
        ) -> io::Result<JoinHandle<()>>,
    {
        // Capacity 1 plus drain-on-full keeps only the newest frame queued
        let (tx, rx) = channel::bounded::<Vec<u8>>(1);
        let drain = rx.clone();
        let mut session = LibcameraVidSession {
            params,
            child: Some(child),
            reader: None,
            frames: rx,
            stderr,
            sequence: 0,
        };

        let stdout = session
            .child
            .as_mut()
            .and_then(|child| child.stdout.take())
            .ok_or_else(|| OpenError::unavailable(params.index, "no stdout pipe"))?;

        let reader = spawn_reader(stdout, tx, drain).map_err(|e| {
            OpenError::unavailable(params.index, format!("reader thread failed: {}", e))
        })?;
        session.reader = Some(reader);
        Ok(session)
    }

    fn exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }
}

impl CaptureSession for LibcameraVidSession {
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, ReadError> {
        if self.child.is_none() {
            return Err(ReadError::disconnected("session closed"));
        }

        match self.frames.recv_timeout(timeout) {
            Ok(buf) => {
                let frame = Frame::new(
                    self.sequence,
                    SystemTime::now(),
                    buf,
                    self.params.width,
                    self.params.height,
                    PixelFormat::I420,
                );
                self.sequence += 1;
                frame.into_rgb()
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.exited() {
                    Err(ReadError::disconnected(format!(
                        "libcamera-vid exited: {}",
                        self.stderr.text()
                    )))
                } else {
                    Err(ReadError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(ReadError::disconnected(format!(
                "libcamera-vid stream closed: {}",
                self.stderr.text()
            ))),
        }
    }

    fn is_alive(&self) -> bool {
        self.child.is_some()
            && self
                .reader
                .as_ref()
                .map(|reader| !reader.is_finished())
                .unwrap_or(false)
    }

    fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        process::terminate(&mut child, TERMINATE_GRACE);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("libcamera-vid reader thread panicked");
            }
        }
        debug!("libcamera-vid session for camera {} closed", self.params.index);
    }
}

impl Drop for LibcameraVidSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CaptureParams {
        CaptureParams {
            index: 0,
            width: 4,
            height: 2,
            fps: 10,
        }
    }

    #[test]
    fn test_missing_tool_is_backend_unavailable() {
        let backend = LibcameraVidBackend { program: None };
        assert!(matches!(
            backend.open(&params()),
            Err(OpenError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn test_odd_dimensions_rejected() {
        let backend = LibcameraVidBackend::with_program("/bin/true");
        let odd = CaptureParams {
            width: 5,
            ..params()
        };
        assert!(matches!(
            backend.open(&odd),
            Err(OpenError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn test_early_exit_fails_open() {
        // `false` ignores its arguments and exits immediately
        let backend = LibcameraVidBackend::with_program("/bin/false");
        assert!(matches!(
            backend.open(&params()),
            Err(OpenError::DeviceUnavailable { index: 0, .. })
        ));
    }

    #[test]
    fn test_reader_spawn_failure_terminates_tool() {
        let mut child = CaptureCommand::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .spawn(Stdio::piped())
            .unwrap();
        let pid = child.id() as libc::pid_t;
        let stderr = StderrTail::capture(&mut child, "sleeper");

        let result = LibcameraVidSession::start(params(), child, stderr, |_, _, _| {
            Err(io::Error::new(io::ErrorKind::Other, "no threads left"))
        });
        assert!(matches!(
            result,
            Err(OpenError::DeviceUnavailable { index: 0, .. })
        ));

        // Terminated and reaped, so the pid no longer exists
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }

    #[test]
    fn test_command_line() {
        let command = LibcameraVidBackend::command(&PathBuf::from("libcamera-vid"), &params());
        let args = command.args.join(" ");
        assert!(args.starts_with("--camera 0 --width 4 --height 2"));
        assert!(args.contains("--codec yuv420"));
        assert!(args.ends_with("--output -"));
    }
}
