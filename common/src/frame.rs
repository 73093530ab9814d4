use bytes::Bytes;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// One encoded camera sample (JPEG bytes) with its capture metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub seq: u64,
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, seq: u64, captured_at_ms: i64) -> Self {
        Self {
            data: data.into(),
            seq,
            captured_at_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<Frame>,
    next_seq: u64,
}

/// Last-value-wins slot holding the most recent frame.
///
/// Writers replace the whole frame and readers clone it, both under one lock.
/// `Bytes` clones are reference-counted, so the critical section never copies
/// image data. There is no queue: a slow reader simply sees the newest frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Returns the sequence number assigned to it.
    pub fn write(&self, data: impl Into<Bytes>) -> u64 {
        let data = data.into();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut slot = self.lock();
        let seq = slot.next_seq;
        slot.next_seq += 1;
        slot.current = Some(Frame::new(data, seq, now_ms));
        seq
    }

    /// The current frame, or `None` before the first write.
    pub fn read(&self) -> Option<Frame> {
        self.lock().current.clone()
    }

    /// Number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.lock().next_seq
    }

    // The slot only ever holds whole frames, so a panic elsewhere while the
    // lock was held cannot leave it half-written.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A captured frame shown in place of the live feed until `expires_at`.
#[derive(Debug, Clone)]
pub struct FreezeState {
    pub frame: Frame,
    pub expires_at: Instant,
}

/// Holds the optional freeze-on-capture override for the preview stream.
#[derive(Debug, Default)]
pub struct FreezeSlot {
    state: Mutex<Option<FreezeState>>,
}

impl FreezeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show `frame` instead of the live feed for `hold`.
    pub fn freeze(&self, frame: Frame, hold: Duration) {
        let expires_at = Instant::now() + hold;
        *self.lock() = Some(FreezeState { frame, expires_at });
    }

    /// The frozen frame if the hold has not elapsed yet.
    pub fn current(&self) -> Option<Frame> {
        let mut state = self.lock();
        match state.as_ref() {
            Some(s) if Instant::now() < s.expires_at => Some(s.frame.clone()),
            Some(_) => {
                *state = None;
                None
            }
            None => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.current().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<FreezeState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn read_before_first_write_is_none() {
        let buffer = FrameBuffer::new();
        assert!(buffer.read().is_none());
        assert_eq!(buffer.frames_written(), 0);
    }

    #[test]
    fn write_replaces_and_numbers_frames() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.write(vec![1, 2, 3]), 0);
        assert_eq!(buffer.write(vec![4, 5]), 1);

        let frame = buffer.read().unwrap();
        assert_eq!(frame.data.as_ref(), &[4, 5]);
        assert_eq!(frame.seq, 1);
        assert_eq!(buffer.frames_written(), 2);
    }

    #[test]
    fn concurrent_readers_never_see_partial_frames() {
        // Each frame is 4 KiB filled with a single byte value; a torn write
        // would show up as a frame with mixed values.
        let buffer = Arc::new(FrameBuffer::new());
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    buffer.write(vec![(i % 251) as u8; 4096]);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let mut last_seq = None;
                    for _ in 0..2000 {
                        if let Some(frame) = buffer.read() {
                            assert_eq!(frame.len(), 4096);
                            let first = frame.data[0];
                            assert!(frame.data.iter().all(|&b| b == first));
                            assert_eq!(u64::from(first), frame.seq % 251);
                            if let Some(prev) = last_seq {
                                assert!(frame.seq >= prev, "sequence went backwards");
                            }
                            last_seq = Some(frame.seq);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(buffer.read().unwrap().seq, 1999);
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_expires_after_hold() {
        let slot = FreezeSlot::new();
        assert!(slot.current().is_none());

        slot.freeze(Frame::new(vec![9, 9], 3, 0), Duration::from_secs(5));
        assert_eq!(slot.current().unwrap().data.as_ref(), &[9, 9]);

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert!(slot.is_frozen());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(slot.current().is_none());
        assert!(!slot.is_frozen());
    }

    #[tokio::test(start_paused = true)]
    async fn refreeze_replaces_previous_frame() {
        let slot = FreezeSlot::new();
        slot.freeze(Frame::new(vec![1], 0, 0), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;
        slot.freeze(Frame::new(vec![2], 1, 0), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(slot.current().unwrap().data.as_ref(), &[2]);
    }
}
