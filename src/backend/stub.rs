//! Scriptable in-memory backend for exercising workers and the manager.

use super::{BackendKind, CaptureBackend, CaptureParams, CaptureSession};
use crate::error::{OpenError, ReadError};
use crate::frame::Frame;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Shared counters observed by tests after sessions are gone
#[derive(Debug, Default)]
pub struct StubCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
}

impl StubCounters {
    /// Successful opens
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed
    pub fn live(&self) -> usize {
        self.opens() - self.closes()
    }
}

#[derive(Clone)]
pub struct StubBackend {
    kind: BackendKind,
    counters: Arc<StubCounters>,
    failing_indices: HashSet<u32>,
    frame_limit: Option<u64>,
    failing_reads: bool,
    frame_size: (u32, u32),
    close_delay: Duration,
}

impl StubBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            counters: Arc::new(StubCounters::default()),
            failing_indices: HashSet::new(),
            frame_limit: None,
            failing_reads: false,
            frame_size: (8, 6),
            close_delay: Duration::ZERO,
        }
    }

    /// Refuse to open this camera index
    pub fn failing_open_for(mut self, index: u32) -> Self {
        self.failing_indices.insert(index);
        self
    }

    /// Produce exactly `limit` frames per session, then time out forever
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Every read fails
    pub fn failing_reads(mut self) -> Self {
        self.failing_reads = true;
        self
    }

    /// Each session takes this long to close
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn counters(&self) -> Arc<StubCounters> {
        Arc::clone(&self.counters)
    }
}

impl CaptureBackend for StubBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn open(&self, params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError> {
        if self.failing_indices.contains(&params.index) {
            return Err(OpenError::unavailable(params.index, "stub refused to open"));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubSession {
            counters: Arc::clone(&self.counters),
            frame_limit: self.frame_limit,
            failing_reads: self.failing_reads,
            frame_size: self.frame_size,
            close_delay: self.close_delay,
            sequence: 0,
            closed: false,
        }))
    }
}

struct StubSession {
    counters: Arc<StubCounters>,
    frame_limit: Option<u64>,
    failing_reads: bool,
    frame_size: (u32, u32),
    close_delay: Duration,
    sequence: u64,
    closed: bool,
}

impl CaptureSession for StubSession {
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, ReadError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(ReadError::disconnected("stub session closed"));
        }

        let exhausted = self.frame_limit.is_some_and(|limit| self.sequence >= limit);
        if self.failing_reads || exhausted {
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Err(ReadError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let (width, height) = self.frame_size;
        let frame = Frame::rgb(
            self.sequence,
            width,
            height,
            vec![self.sequence as u8; (width * height * 3) as usize],
        );
        self.sequence += 1;
        Ok(frame)
    }

    fn is_alive(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        if !self.closed {
            thread::sleep(self.close_delay);
            self.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for StubSession {
    fn drop(&mut self) {
        self.close();
    }
}
