//! Fan-out buffering for stage outputs.
//!
//! A stage feeding several consumers keeps a shared replay buffer with one
//! cursor per tap: every tap sees every produced item exactly once, taps
//! may progress at different rates, and an item is dropped as soon as the
//! slowest tap has passed it.

use crate::item::Item;
use std::collections::VecDeque;

/// Identifies one consumer of a stage's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapId(pub usize);

/// The shared replay buffer and per-tap cursors.
#[derive(Debug, Default)]
pub struct TeeBuffer {
    buffer: VecDeque<Item>,
    /// Absolute position of `buffer[0]` in the produced stream.
    base: u64,
    cursors: Vec<u64>,
    /// Set once the producing side has reached end-of-stream.
    ended: bool,
}

/// What a tap sees when it asks for its next item.
#[derive(Debug, PartialEq)]
pub enum TapPull {
    /// The tap's next item, already buffered.
    Ready(Item),
    /// The tap is at the buffer frontier; produce one more item.
    NeedsMore,
    /// The tap has consumed everything and the stream has ended.
    Done,
}

impl TeeBuffer {
    /// Creates an empty buffer with no taps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new tap. Must happen before any item is dropped, i.e.
    /// before consumption starts.
    pub fn register(&mut self) -> TapId {
        self.cursors.push(self.base);
        TapId(self.cursors.len() - 1)
    }

    /// Number of registered taps.
    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.cursors.len()
    }

    /// True once every tap has consumed the whole ended stream.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.ended
            && !self.cursors.is_empty()
            && self
                .cursors
                .iter()
                .all(|&c| c >= self.base + self.buffer.len() as u64)
    }

    /// Attempts to serve the tap's next item from the buffer.
    pub fn pull(&mut self, tap: TapId) -> TapPull {
        let cursor = self.cursors[tap.0];
        let frontier = self.base + self.buffer.len() as u64;
        if cursor < frontier {
            let item = self.buffer[(cursor - self.base) as usize].clone();
            self.cursors[tap.0] += 1;
            self.trim();
            return TapPull::Ready(item);
        }
        if self.ended {
            TapPull::Done
        } else {
            TapPull::NeedsMore
        }
    }

    /// Appends a freshly produced item.
    pub fn push(&mut self, item: Item) {
        self.buffer.push_back(item);
    }

    /// Marks the producing side as ended.
    pub fn end(&mut self) {
        self.ended = true;
    }

    fn trim(&mut self) {
        let min = self.cursors.iter().copied().min().unwrap_or(self.base);
        while self.base < min && !self.buffer.is_empty() {
            self.buffer.pop_front();
            self.base += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(n: i64) -> Item {
        Item::Value(json!(n))
    }

    #[test]
    fn test_single_tap_passthrough() {
        let mut tee = TeeBuffer::new();
        let tap = tee.register();
        assert_eq!(tee.pull(tap), TapPull::NeedsMore);
        tee.push(v(1));
        assert_eq!(tee.pull(tap), TapPull::Ready(v(1)));
        tee.end();
        assert_eq!(tee.pull(tap), TapPull::Done);
        assert!(tee.all_done());
    }

    #[test]
    fn test_taps_progress_independently() {
        let mut tee = TeeBuffer::new();
        let fast = tee.register();
        let slow = tee.register();
        tee.push(v(1));
        tee.push(v(2));

        assert_eq!(tee.pull(fast), TapPull::Ready(v(1)));
        assert_eq!(tee.pull(fast), TapPull::Ready(v(2)));
        assert_eq!(tee.pull(fast), TapPull::NeedsMore);

        // The slow tap still sees both items, exactly once.
        assert_eq!(tee.pull(slow), TapPull::Ready(v(1)));
        assert_eq!(tee.pull(slow), TapPull::Ready(v(2)));
    }

    #[test]
    fn test_items_dropped_once_all_taps_passed() {
        let mut tee = TeeBuffer::new();
        let a = tee.register();
        let b = tee.register();
        tee.push(v(1));
        assert_eq!(tee.pull(a), TapPull::Ready(v(1)));
        assert_eq!(tee.buffer.len(), 1);
        assert_eq!(tee.pull(b), TapPull::Ready(v(1)));
        assert_eq!(tee.buffer.len(), 0);
    }

    #[test]
    fn test_all_done_requires_every_tap() {
        let mut tee = TeeBuffer::new();
        let a = tee.register();
        let _b = tee.register();
        tee.push(v(1));
        tee.end();
        assert_eq!(tee.pull(a), TapPull::Ready(v(1)));
        assert_eq!(tee.pull(a), TapPull::Done);
        assert!(!tee.all_done());
    }
}
