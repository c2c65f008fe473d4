//! Checkpoint scheduler: tracks the watermark and turns the aggregator's
//! checkpoint into the next fetch window.
//!
//! The watermark is the last timestamp whose events have all been dispatched.
//! Windows handed out across successive calls are contiguous: the `to` of one
//! window plus one is the `from` of the next, unless a reorg rewound the
//! watermark in between.

use serde::{Deserialize, Serialize};

/// An inclusive `[from, to]` timestamp window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRange {
    pub from: u64,
    pub to: u64,
}

impl std::fmt::Display for FetchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Watermark + window computation.
#[derive(Debug, Clone, Default)]
pub struct CheckpointScheduler {
    /// `None` until something has been processed since the last reset.
    watermark: Option<u64>,
}

impl CheckpointScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// The watermark as reported by the gauge: `0` while unset.
    pub fn processed_through(&self) -> u64 {
        self.watermark.unwrap_or(0)
    }

    /// The next window to fetch for `checkpoint`, or `None` if there is
    /// nothing new. A checkpoint of `0` with no watermark means the aggregator
    /// has not finalized anything yet.
    pub fn next_range(&self, checkpoint: u64) -> Option<FetchRange> {
        let from = match self.watermark {
            Some(w) => w.checked_add(1)?,
            None if checkpoint == 0 => return None,
            None => 0,
        };
        (from <= checkpoint).then_some(FetchRange {
            from,
            to: checkpoint,
        })
    }

    /// Move the watermark forward to `timestamp`. Never moves it backwards.
    pub fn advance(&mut self, timestamp: u64) {
        self.watermark = Some(self.watermark.map_or(timestamp, |w| w.max(timestamp)));
    }

    /// Rewind the watermark to `timestamp`. Returns `false` (and does nothing)
    /// if there is nothing after `timestamp` to rewind.
    pub fn rewind(&mut self, timestamp: u64) -> bool {
        match self.watermark {
            Some(w) if timestamp < w => {
                self.watermark = Some(timestamp);
                true
            }
            _ => false,
        }
    }

    /// Forget the watermark.
    pub fn reset(&mut self) {
        self.watermark = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(from: u64, to: u64) -> Option<FetchRange> {
        Some(FetchRange { from, to })
    }

    #[test]
    fn fresh_scheduler_waits_for_first_checkpoint() {
        let s = CheckpointScheduler::new();
        assert_eq!(s.next_range(0), None);
        assert_eq!(s.next_range(10), range(0, 10));
        assert_eq!(s.processed_through(), 0);
    }

    #[test]
    fn ranges_are_contiguous() {
        let mut s = CheckpointScheduler::new();
        let mut fetched = vec![];
        for checkpoint in [0, 10, 10, 50] {
            if let Some(r) = s.next_range(checkpoint) {
                fetched.push((r.from, r.to));
                s.advance(r.to);
            }
        }
        assert_eq!(fetched, vec![(0, 10), (11, 50)]);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut s = CheckpointScheduler::new();
        s.advance(10);
        s.advance(4);
        assert_eq!(s.watermark(), Some(10));
    }

    #[test]
    fn rewind_only_moves_backwards() {
        let mut s = CheckpointScheduler::new();
        assert!(!s.rewind(5)); // nothing processed yet
        s.advance(10);
        assert!(!s.rewind(10));
        assert!(!s.rewind(12));
        assert!(s.rewind(6));
        assert_eq!(s.next_range(9), range(7, 9));
    }

    #[test]
    fn reset_clears_watermark() {
        let mut s = CheckpointScheduler::new();
        s.advance(10);
        s.reset();
        assert_eq!(s.watermark(), None);
        assert_eq!(s.next_range(10), range(0, 10));
    }
}
