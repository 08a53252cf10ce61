use crate::frame::Frame;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-writer, many-reader holder of a camera's most recent frame.
///
/// Publishing replaces the previous frame wholesale, so readers always see
/// either the old or the new frame, never a mix.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    frame: RwLock<Option<Frame>>,
    published: AtomicU64,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        *self.frame.write() = Some(frame);
        self.published.fetch_add(1, Ordering::Release);
    }

    /// Shares the pixel buffer with the slot; no copy is made
    pub fn latest(&self) -> Option<Frame> {
        self.frame.read().clone()
    }

    pub fn has_frame(&self) -> bool {
        self.frame.read().is_some()
    }

    /// Total frames ever published
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        *self.frame.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_publish_replaces_frame() {
        let slot = LatestFrameSlot::new();
        assert!(slot.latest().is_none());

        slot.publish(Frame::rgb(1, 1, 1, vec![1, 2, 3]));
        slot.publish(Frame::rgb(2, 1, 1, vec![4, 5, 6]));

        let frame = slot.latest().unwrap();
        assert_eq!(frame.id, 2);
        assert_eq!(slot.published(), 2);

        slot.clear();
        assert!(!slot.has_frame());
        assert_eq!(slot.published(), 2);
    }

    #[test]
    fn test_readers_share_buffer() {
        let slot = LatestFrameSlot::new();
        slot.publish(Frame::rgb(1, 2, 1, vec![9; 6]));
        let a = slot.latest().unwrap();
        let b = slot.latest().unwrap();
        assert!(Arc::ptr_eq(&a.data, &b.data));
    }

    #[test]
    fn test_readers_never_see_older_frames() {
        let slot = Arc::new(LatestFrameSlot::new());
        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for id in 0..2000u64 {
                    slot.publish(Frame::rgb(id, 1, 1, vec![0, 0, 0]));
                }
            })
        };

        let mut last_seen = None;
        while !writer.is_finished() {
            if let Some(frame) = slot.latest() {
                if let Some(last) = last_seen {
                    assert!(frame.id >= last);
                }
                last_seen = Some(frame.id);
            }
        }
        writer.join().unwrap();
        assert_eq!(slot.latest().unwrap().id, 1999);
    }
}
