use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct FrameAccessInfo {
    /// History of access timestamps (most recent at back), at most k entries
    history: VecDeque<Timestamp>,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl FrameAccessInfo {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Timestamp of the k-th most recent access, or None when the frame has
    /// fewer than k recorded accesses (+inf backward k-distance).
    fn kth_recent(&self, k: usize) -> Option<Timestamp> {
        if self.history.len() < k {
            None
        } else {
            Some(self.history[self.history.len() - k])
        }
    }

    fn earliest(&self) -> Option<Timestamp> {
        self.history.front().copied()
    }
}

struct ReplacerState {
    frames: HashMap<FrameId, FrameAccessInfo>,
    /// Number of evictable frames
    curr_size: usize,
    /// Monotonically increasing access counter
    current_timestamp: Timestamp,
}

/// LRU-K replacement policy.
///
/// The victim is the evictable frame with the largest backward k-distance:
/// the distance from now back to its k-th most recent access. A frame with
/// fewer than k recorded accesses has +inf distance; ties among such frames
/// break toward the earliest first access (plain LRU on the prefix history).
pub struct LruKReplacer {
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    pub fn new(k: usize, max_frames: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            max_frames,
            state: Mutex::new(ReplacerState {
                frames: HashMap::new(),
                curr_size: 0,
                current_timestamp: 0,
            }),
        }
    }

    /// Evicts the evictable frame with the largest backward k-distance and
    /// drops its history. Returns None if no frame is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.curr_size == 0 {
            return None;
        }

        let mut victim: Option<FrameId> = None;
        let mut victim_kth: Option<Timestamp> = None;
        let mut victim_earliest: Option<Timestamp> = None;

        for (&frame_id, info) in state.frames.iter() {
            if !info.is_evictable {
                continue;
            }
            let kth = info.kth_recent(self.k);
            let earliest = info.earliest();

            let replace = match (victim_kth, kth) {
                // Current victim has +inf distance, candidate is finite
                (None, Some(_)) => false,
                // Candidate has +inf distance, current victim is finite
                (Some(_), None) => true,
                // Both +inf: earlier first access wins
                (None, None) => match (victim_earliest, earliest) {
                    (Some(v), Some(c)) => c < v,
                    (None, Some(_)) => true,
                    _ => false,
                },
                // Both finite: older k-th access means larger distance
                (Some(v), Some(c)) => c < v,
            };

            if victim.is_none() || replace {
                victim = Some(frame_id);
                victim_kth = kth;
                victim_earliest = earliest;
            }
        }

        if let Some(frame_id) = victim {
            state.frames.remove(&frame_id);
            state.curr_size -= 1;
        }
        victim
    }

    /// Records an access to the given frame at the next timestamp.
    ///
    /// Panics when the frame id is out of range; that is a caller bug which
    /// would silently skew the policy if tolerated.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.max_frames,
            "frame id {} out of range (replacer capacity {})",
            frame_id,
            self.max_frames
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let timestamp = state.current_timestamp;
        state.current_timestamp += 1;
        state
            .frames
            .entry(frame_id)
            .or_insert_with(FrameAccessInfo::new)
            .record_access(timestamp, self.k);
    }

    /// Marks a tracked frame evictable or not. No-op for untracked frames
    /// and for transitions to the current state.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        assert!(
            frame_id.as_usize() < self.max_frames,
            "frame id {} out of range (replacer capacity {})",
            frame_id,
            self.max_frames
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(info) = state.frames.get_mut(&frame_id) {
            if info.is_evictable != is_evictable {
                info.is_evictable = is_evictable;
                if is_evictable {
                    state.curr_size += 1;
                } else {
                    state.curr_size -= 1;
                }
            }
        }
    }

    /// Drops a frame's history entirely. Untracked frames are ignored.
    ///
    /// Panics when called on a tracked non-evictable frame: the caller still
    /// holds pins on it and removing the history would break eviction
    /// eligibility accounting.
    pub fn remove(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.max_frames,
            "frame id {} out of range (replacer capacity {})",
            frame_id,
            self.max_frames
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(info) = state.frames.get(&frame_id) {
            assert!(
                info.is_evictable,
                "remove called on non-evictable frame {}",
                frame_id
            );
            state.frames.remove(&frame_id);
            state.curr_size -= 1;
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().curr_size
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evict_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_infinite_distance_uses_earliest_access() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(2));

        for i in 0..3 {
            replacer.set_evictable(FrameId::new(i), true);
        }
        assert_eq!(replacer.size(), 3);

        // All have a single access, so all +inf: FIFO on first access
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_infinite_beats_finite() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 1 has fewer than k accesses, so it goes first
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_finite_distance_ordering() {
        let replacer = LruKReplacer::new(2, 10);

        // Frame 0 at t=0,1; frame 1 at t=2,3; frame 2 at t=4,5
        for i in 0..3 {
            replacer.record_access(FrameId::new(i));
            replacer.record_access(FrameId::new(i));
        }
        for i in 0..3 {
            replacer.set_evictable(FrameId::new(i), true);
        }

        // Oldest 2nd-most-recent access evicts first
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    }

    #[test]
    fn test_non_evictable_frames_skipped() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_toggle_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_remove_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        replacer.remove(FrameId::new(0));

        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn test_remove_pinned_frame_panics() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.record_access(FrameId::new(0));
        replacer.remove(FrameId::new(0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_frame_panics() {
        let replacer = LruKReplacer::new(2, 4);
        replacer.record_access(FrameId::new(4));
    }

    #[test]
    fn test_history_bounded_by_k() {
        let replacer = LruKReplacer::new(2, 10);

        for _ in 0..10 {
            replacer.record_access(FrameId::new(0));
        }
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Only the last k accesses count: frame 0's 2nd-most-recent is t=8,
        // frame 1's is t=10, so frame 0 has the larger distance.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    }
}
