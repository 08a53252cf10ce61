use super::{BackendKind, CaptureBackend, CaptureParams, CaptureSession};
use crate::error::{OpenError, ReadError};
use crate::frame::Frame;
use std::time::Duration;
use tracing::debug;

const BACKGROUND: u8 = 40;
const BLOCK: [u8; 3] = [220, 180, 90];

/// Synthetic cameras: a bright block hopping across a flat background.
///
/// Consecutive frames never overlap the block, so every frame after the
/// first reads as motion to the detector.
pub struct TestPatternBackend;

impl TestPatternBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for TestPatternBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TestPattern
    }

    fn open(&self, params: &CaptureParams) -> Result<Box<dyn CaptureSession>, OpenError> {
        if params.width < 8 || params.height < 8 {
            return Err(OpenError::UnsupportedMode {
                index: params.index,
                width: params.width,
                height: params.height,
                details: "test pattern needs at least 8x8".to_string(),
            });
        }
        debug!("Test pattern camera {} opened", params.index);
        Ok(Box::new(TestPatternSession {
            params: *params,
            sequence: 0,
            open: true,
        }))
    }
}

struct TestPatternSession {
    params: CaptureParams,
    sequence: u64,
    open: bool,
}

impl TestPatternSession {
    fn render(&self) -> Vec<u8> {
        let width = self.params.width as usize;
        let height = self.params.height as usize;
        let block = width.min(height) / 4;
        let travel = width - block;
        // Cameras start at different offsets so their frames differ
        let x0 = (self.sequence as usize * block + self.params.index as usize * block / 2) % travel.max(1);
        let y0 = (height - block) / 2;

        let mut data = vec![BACKGROUND; width * height * 3];
        for y in y0..y0 + block {
            let row = y * width * 3;
            for x in x0..x0 + block {
                data[row + x * 3..row + x * 3 + 3].copy_from_slice(&BLOCK);
            }
        }
        data
    }
}

impl CaptureSession for TestPatternSession {
    fn read_frame(&mut self, _timeout: Duration) -> Result<Frame, ReadError> {
        if !self.open {
            return Err(ReadError::disconnected("session closed"));
        }
        let frame = Frame::rgb(
            self.sequence,
            self.params.width,
            self.params.height,
            self.render(),
        );
        self.sequence += 1;
        Ok(frame)
    }

    fn is_alive(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(width: u32, height: u32) -> Box<dyn CaptureSession> {
        TestPatternBackend::new()
            .open(&CaptureParams {
                index: 0,
                width,
                height,
                fps: 30,
            })
            .unwrap()
    }

    #[test]
    fn test_frames_are_rgb_and_sequenced() {
        let mut session = open(160, 120);
        let first = session.read_frame(Duration::from_millis(10)).unwrap();
        let second = session.read_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert!(first.validate_size());
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = open(32, 32);
        session.close();
        session.close();
        assert!(!session.is_alive());
        assert!(matches!(
            session.read_frame(Duration::from_millis(10)),
            Err(ReadError::Disconnected { .. })
        ));
    }

    #[test]
    fn test_tiny_mode_rejected() {
        let result = TestPatternBackend::new().open(&CaptureParams {
            index: 0,
            width: 4,
            height: 4,
            fps: 30,
        });
        assert!(matches!(result, Err(OpenError::UnsupportedMode { .. })));
    }
}
