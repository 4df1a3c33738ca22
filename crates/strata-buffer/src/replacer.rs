//! Replacement policies for the tier cache.

use parking_lot::Mutex;

/// Identifier for a slot in the tier cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    #[inline]
    fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Trait for replacement algorithms.
///
/// Whether a resident frame may be evicted is decided by the caller at
/// eviction time, since the cache knows which tiers are still referenced.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as holding a tier.
    fn admit(&self, frame_id: FrameId);

    /// Selects a resident victim frame accepted by `is_evictable`.
    ///
    /// Returns None if no resident frame is evictable.
    fn evict(&self, is_evictable: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Adds `additional` frames to the end of the frame range.
    fn grow(&self, additional: usize);

    /// Returns the number of resident frames.
    fn size(&self) -> usize;
}

/// Clock replacement algorithm implementation.
///
/// The clock algorithm maintains a circular buffer of frames with reference bits.
/// When selecting a victim:
/// 1. Check if current frame's reference bit is 0 and the frame is evictable
/// 2. If yes, select it as victim
/// 3. If no, clear reference bit and advance clock hand
/// 4. Repeat until victim found or two full circles completed
pub struct ClockReplacer {
    inner: Mutex<ClockReplacerInner>,
}

struct ClockReplacerInner {
    reference_bits: Vec<bool>,
    resident: Vec<bool>,
    resident_count: usize,
    clock_hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockReplacerInner {
                reference_bits: vec![false; num_frames],
                resident: vec![false; num_frames],
                resident_count: 0,
                clock_hand: 0,
            }),
        }
    }

    /// Returns the total number of frames tracked.
    pub fn capacity(&self) -> usize {
        self.inner.lock().resident.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if frame_id.index() < inner.reference_bits.len() {
            inner.reference_bits[frame_id.index()] = true;
        }
    }

    fn admit(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let index = frame_id.index();
        if index >= inner.resident.len() {
            return;
        }
        if !inner.resident[index] {
            inner.resident[index] = true;
            inner.resident_count += 1;
        }
        inner.reference_bits[index] = true;
    }

    fn evict(&self, is_evictable: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.resident_count == 0 {
            return None;
        }

        let num_frames = inner.resident.len();

        // Make at most 2 full rotations to find a victim
        for _ in 0..(2 * num_frames) {
            let hand = inner.clock_hand;
            let frame_id = FrameId(hand as u32);
            inner.clock_hand = (hand + 1) % num_frames;

            if !inner.resident[hand] || !is_evictable(frame_id) {
                continue;
            }
            if inner.reference_bits[hand] {
                // Second chance
                inner.reference_bits[hand] = false;
                continue;
            }
            inner.resident[hand] = false;
            inner.resident_count -= 1;
            return Some(frame_id);
        }

        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let index = frame_id.index();
        if index < inner.resident.len() {
            if inner.resident[index] {
                inner.resident[index] = false;
                inner.resident_count -= 1;
            }
            inner.reference_bits[index] = false;
        }
    }

    fn grow(&self, additional: usize) {
        let mut inner = self.inner.lock();
        let new_len = inner.resident.len() + additional;
        inner.resident.resize(new_len, false);
        inner.reference_bits.resize(new_len, false);
    }

    fn size(&self) -> usize {
        self.inner.lock().resident_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(_: FrameId) -> bool {
        true
    }

    #[test]
    fn test_frame_id_display() {
        assert_eq!(FrameId(42).to_string(), "frame:42");
    }

    #[test]
    fn test_clock_replacer_new() {
        let replacer = ClockReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_evict_empty() {
        let replacer = ClockReplacer::new(10);
        assert!(replacer.evict(&always).is_none());
    }

    #[test]
    fn test_clock_replacer_evict_single() {
        let replacer = ClockReplacer::new(10);
        replacer.admit(FrameId(5));
        assert_eq!(replacer.size(), 1);

        // Admission sets the reference bit; the second rotation clears it.
        assert_eq!(replacer.evict(&always), Some(FrameId(5)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_second_chance() {
        let replacer = ClockReplacer::new(3);
        replacer.admit(FrameId(0));
        replacer.admit(FrameId(1));
        replacer.admit(FrameId(2));

        // First eviction clears every bit and takes frame 0 on the second pass.
        assert_eq!(replacer.evict(&always), Some(FrameId(0)));

        // Frame 1 is touched again, so frame 2 goes next.
        replacer.record_access(FrameId(1));
        assert_eq!(replacer.evict(&always), Some(FrameId(2)));
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_clock_replacer_respects_predicate() {
        let replacer = ClockReplacer::new(4);
        for i in 0..4 {
            replacer.admit(FrameId(i));
        }

        let pinned = |frame: FrameId| frame != FrameId(0) && frame != FrameId(1);
        let victim = replacer.evict(&pinned).unwrap();
        assert!(victim == FrameId(2) || victim == FrameId(3));

        let none = |_: FrameId| false;
        assert!(replacer.evict(&none).is_none());
        assert_eq!(replacer.size(), 3);
    }

    #[test]
    fn test_clock_replacer_remove() {
        let replacer = ClockReplacer::new(10);
        replacer.admit(FrameId(0));
        replacer.admit(FrameId(1));
        assert_eq!(replacer.size(), 2);

        replacer.remove(FrameId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(&always), Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_out_of_bounds() {
        let replacer = ClockReplacer::new(5);

        // These should not panic
        replacer.admit(FrameId(100));
        replacer.record_access(FrameId(100));
        replacer.remove(FrameId(100));

        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_grow() {
        let replacer = ClockReplacer::new(1);
        replacer.grow(2);
        assert_eq!(replacer.capacity(), 3);

        replacer.admit(FrameId(2));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(&always), Some(FrameId(2)));
    }
}
