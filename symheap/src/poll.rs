//! Poll-loop stall detection
//!
//! Protocol loops in this crate are bounded only by peer progress: a `put`
//! retries until the destination services its growth requests, and the heap
//! barrier spins until every rank arrives. Those loops never time out (an
//! external watchdog owns that policy), but they do count iterations and
//! raise an explicit "likely stalled" observable each time the count crosses
//! a threshold, so callers can escalate however they like.

use log::warn;

use crate::transport::Rank;

/// Poll iterations between stall warnings.
pub const DEFAULT_STALL_POLLS: u64 = 100_000;

/// Iteration counter for one poll loop.
pub(crate) struct Poller {
    what: &'static str,
    rank: Rank,
    threshold: u64,
    polls: u64,
}

impl Poller {
    pub fn new(what: &'static str, rank: Rank, threshold: u64) -> Poller {
        Poller { what, rank, threshold, polls: 0 }
    }

    /// Count one iteration. Returns true (and logs) each time the poll
    /// count crosses a multiple of the threshold.
    pub fn tick(&mut self) -> bool {
        self.polls += 1;
        if self.threshold != 0 && self.polls % self.threshold == 0 {
            warn!(
                "rank {}: {} has polled {} times without completing; a peer may be stalled",
                self.rank, self.what, self.polls
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_fire_on_threshold_multiples() {
        let mut poller = Poller::new("test loop", 0, 3);
        let fired: Vec<bool> = (0..7).map(|_| poller.tick()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_zero_threshold_never_fires() {
        let mut poller = Poller::new("test loop", 0, 0);
        assert!((0..1000).all(|_| !poller.tick()));
    }
}
