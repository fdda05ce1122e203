//! Double-buffered frame exchange between the capture thread and the renderer

use super::NUM_BANDS;
use parking_lot::Mutex;

/// One processed frame in visual-height units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    /// Smoothed bar heights in `[0, NUM_BANDS]`
    pub heights: [f32; NUM_BANDS],

    /// Held peaks in `[0, NUM_BANDS-1]`
    pub peaks: [f32; NUM_BANDS],

    /// Mean of `heights`
    pub energy: f32,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            heights: [0.0; NUM_BANDS],
            peaks: [0.0; NUM_BANDS],
            energy: 0.0,
        }
    }
}

struct Slots {
    frames: [Frame; 2],
    active: usize,
    updates: u64,
}

/// Single-writer, single-reader frame exchange.
///
/// The writer always fills the slot that is not active, then flips `active`
/// and bumps the update counter, all under one lock. The reader compares the
/// counter and copies the active slot under the same lock, so it never sees a
/// half-written frame.
pub struct FrameHandoff {
    slots: Mutex<Slots>,
}

impl Default for FrameHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                frames: [Frame::default(); 2],
                active: 0,
                updates: 0,
            }),
        }
    }

    /// Publish a finished frame.
    pub fn publish(&self, frame: &Frame) {
        let mut slots = self.slots.lock();
        let inactive = 1 - slots.active;
        slots.frames[inactive] = *frame;
        slots.active = inactive;
        slots.updates = slots.updates.wrapping_add(1);
    }

    /// Copy the active frame if anything was published since `last_seen`.
    ///
    /// `last_seen` is advanced to the current update count when a frame is
    /// returned.
    pub fn read_if_newer(&self, last_seen: &mut u64) -> Option<Frame> {
        let slots = self.slots.lock();
        if slots.updates == *last_seen {
            return None;
        }
        *last_seen = slots.updates;
        Some(slots.frames[slots.active])
    }

    /// Number of frames published so far
    pub fn updates(&self) -> u64 {
        self.slots.lock().updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn uniform_frame(value: f32) -> Frame {
        Frame {
            heights: [value; NUM_BANDS],
            peaks: [value; NUM_BANDS],
            energy: value,
        }
    }

    #[test]
    fn nothing_to_read_before_first_publish() {
        let handoff = FrameHandoff::new();
        let mut last_seen = 0;
        assert!(handoff.read_if_newer(&mut last_seen).is_none());
    }

    #[test]
    fn each_publish_is_delivered_once() {
        let handoff = FrameHandoff::new();
        let mut last_seen = 0;

        handoff.publish(&uniform_frame(3.0));
        assert_eq!(handoff.read_if_newer(&mut last_seen), Some(uniform_frame(3.0)));
        assert_eq!(last_seen, 1);
        assert!(handoff.read_if_newer(&mut last_seen).is_none());

        handoff.publish(&uniform_frame(4.0));
        handoff.publish(&uniform_frame(5.0));
        assert_eq!(handoff.read_if_newer(&mut last_seen), Some(uniform_frame(5.0)));
        assert_eq!(last_seen, 3);
    }

    #[test]
    fn publish_alternates_slots_without_touching_active() {
        let handoff = FrameHandoff::new();

        handoff.publish(&uniform_frame(1.0));
        {
            let slots = handoff.slots.lock();
            assert_eq!(slots.active, 1);
            assert_eq!(slots.frames[0], Frame::default());
        }

        handoff.publish(&uniform_frame(2.0));
        let slots = handoff.slots.lock();
        assert_eq!(slots.active, 0);
        assert_eq!(slots.frames[1], uniform_frame(1.0));
        assert_eq!(slots.frames[0], uniform_frame(2.0));
    }

    #[test]
    fn concurrent_reader_never_sees_torn_frame() {
        let handoff = Arc::new(FrameHandoff::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let handoff = handoff.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 1..=2000u32 {
                    handoff.publish(&uniform_frame((i % 64) as f32));
                    if i % 50 == 0 {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut last_seen = 0;
        let mut previous_update = 0;
        let mut reads = 0;
        loop {
            let finished = done.load(Ordering::Acquire);
            if let Some(frame) = handoff.read_if_newer(&mut last_seen) {
                let expected = frame.energy;
                assert!(frame.heights.iter().all(|&h| h == expected), "torn heights");
                assert!(frame.peaks.iter().all(|&p| p == expected), "torn peaks");
                assert!(last_seen > previous_update);
                previous_update = last_seen;
                reads += 1;
            }
            if finished && handoff.updates() == last_seen {
                break;
            }
            thread::sleep(Duration::from_micros(70));
        }

        writer.join().unwrap();
        assert!(reads > 0);
        assert_eq!(last_seen, 2000);
    }
}
