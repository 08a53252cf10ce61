//! Helpers for backends that drive a camera through a vendor command-line tool.

use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_TAIL_LINES: usize = 8;

/// Program plus arguments for one capture tool invocation
#[derive(Debug, Clone)]
pub struct CaptureCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CaptureCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: ToString>(mut self, arg: S) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn spawn(&self, stdout: Stdio) -> io::Result<Child> {
        debug!("Spawning {} {}", self.program.display(), self.args.join(" "));
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
    }
}

/// First existing path among the candidate locations of a tool
pub fn locate_tool(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

/// Last few stderr lines of a child, kept for error messages
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<Vec<String>>>,
}

impl StderrTail {
    /// Drain the child's stderr on a background thread so the pipe never fills
    pub fn capture(child: &mut Child, label: &str) -> Self {
        let tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            let lines = Arc::clone(&tail.lines);
            let label = label.to_string();
            let spawned = thread::Builder::new()
                .name(format!("{}-stderr", label))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        debug!("[{}] {}", label, line);
                        let mut lines = lines.lock();
                        if lines.len() == STDERR_TAIL_LINES {
                            lines.remove(0);
                        }
                        lines.push(line);
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to spawn stderr reader: {}", e);
            }
        }
        tail
    }

    pub fn text(&self) -> String {
        let lines = self.lines.lock();
        if lines.is_empty() {
            "no diagnostic output".to_string()
        } else {
            lines.join(" | ")
        }
    }

    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.lines
            .lock()
            .iter()
            .any(|line| line.to_lowercase().contains(&needle))
    }
}

/// Read a child's whole stderr once it has exited
pub fn read_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut text);
    }
    text.trim().to_string()
}

/// Poll until the child exits or the deadline passes
pub fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
pub fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    let pid = child.id() as libc::pid_t;
    // SAFETY: the pid belongs to a child we have not reaped yet
    let signalled = unsafe { libc::kill(pid, libc::SIGTERM) } == 0;
    if signalled {
        match wait_until(child, Instant::now() + grace) {
            Ok(Some(status)) => {
                debug!("Capture process {} exited with {}", pid, status);
                return;
            }
            Ok(None) => warn!(
                "Capture process {} ignored SIGTERM for {:?}, killing",
                pid, grace
            ),
            Err(e) => warn!("Failed to wait for capture process {}: {}", pid, e),
        }
    }

    if let Err(e) = child.kill() {
        debug!("Kill of capture process {} failed: {}", pid, e);
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_tool_skips_missing() {
        assert_eq!(locate_tool(&["/nonexistent/libcamera-vid"]), None);
        assert_eq!(
            locate_tool(&["/nonexistent/sh", "/bin/sh"]),
            Some(PathBuf::from("/bin/sh"))
        );
    }

    #[test]
    fn test_terminate_stops_long_running_child() {
        let mut child = CaptureCommand::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .spawn(Stdio::null())
            .unwrap();
        let started = Instant::now();
        terminate(&mut child, Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_wait_until_deadline() {
        let mut child = CaptureCommand::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .spawn(Stdio::null())
            .unwrap();
        let status = wait_until(&mut child, Instant::now() + Duration::from_millis(50)).unwrap();
        assert!(status.is_none());
        terminate(&mut child, Duration::from_millis(500));
    }

    #[test]
    fn test_read_stderr_after_exit() {
        let mut child = CaptureCommand::new("/bin/sh")
            .arg("-c")
            .arg("echo 'no cameras available' >&2; exit 1")
            .spawn(Stdio::null())
            .unwrap();
        let status = wait_until(&mut child, Instant::now() + Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert_eq!(read_stderr(&mut child), "no cameras available");
    }
}
