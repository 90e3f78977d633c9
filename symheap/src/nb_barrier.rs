//! Non-blocking collective barrier
//!
//! Detects "all ranks arrived" without ever blocking the caller, so a rank
//! waiting for the collective can keep servicing growth requests against its
//! own heap. Each rank owns one arrival counter at a symmetric segment
//! offset; a nonzero counter means arrived. Counters are written only by
//! their own rank and read one-sidedly by everyone else, with a local cache
//! so each peer is fetched remotely at most once per barrier round.

use crate::transport::{GlobalAddr, Transport};

/// Arrival tracking for one rank of the collective.
///
/// `try_arrive` may be called any number of times; `reset` must only be
/// called after a true collective barrier that followed every rank
/// observing "all arrived"; resetting earlier can zero a mark another rank
/// has not seen yet.
pub struct NonBlockingBarrier {
    /// Symmetric offset of the per-rank arrival counter.
    marks: u64,
    /// Peers already observed arrived this round.
    cached: Box<[bool]>,
}

impl NonBlockingBarrier {
    /// Collective. Allocates the arrival counter slot; fatal if the control
    /// region cannot hold it.
    pub fn new<T: Transport>(transport: &T) -> NonBlockingBarrier {
        let marks = transport.alloc_symmetric(8).unwrap_or_else(|e| {
            transport.fatal(format_args!("cannot allocate barrier arrival marks: {e}"))
        });
        let mut nbb = NonBlockingBarrier {
            marks,
            cached: vec![false; transport.ranks()].into_boxed_slice(),
        };
        nbb.reset(transport);
        nbb
    }

    fn mark_of(&self, rank: usize) -> GlobalAddr {
        GlobalAddr::new(rank, self.marks)
    }

    /// Record this rank's arrival (again) and count arrived ranks.
    ///
    /// Scans from a rotating start offset (previous poll count plus own
    /// rank) so repeated polls don't all hammer the same laggard first,
    /// and stops at the first rank not yet observed arrived. Returns the
    /// number observed arrived, `ranks()` when the collective is complete.
    pub fn try_arrive<T: Transport>(&mut self, transport: &T) -> usize {
        let me = transport.rank();
        let ranks = transport.ranks();
        let polls = transport.fetch_add(self.mark_of(me), 1);

        let start = (polls as u64 as usize).wrapping_add(me);
        let mut arrived = 0;
        for i in 0..ranks {
            let peer = (start + i) % ranks;
            if self.cached[peer] {
                arrived += 1;
            } else if transport.read_i64(self.mark_of(peer)) > 0 {
                self.cached[peer] = true;
                arrived += 1;
            } else {
                break;
            }
        }
        arrived
    }

    /// Zero this rank's mark and forget cached observations.
    pub fn reset<T: Transport>(&mut self, transport: &T) {
        transport.write_i64(self.mark_of(transport.rank()), 0);
        transport.fence();
        self.cached.fill(false);
    }
}
