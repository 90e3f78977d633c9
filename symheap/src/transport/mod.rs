//! One-sided transport layer
//!
//! # Purpose
//! Everything the distributed heap needs from the outside world: rank
//! identity, a true collective barrier, a memory fence, remote atomics,
//! remote byte put/get, symmetric and local allocation inside per-rank
//! shared segments, and whole-run fatal abort.
//!
//! # Architecture
//! All cross-rank addresses are `(rank, byte offset into that rank's
//! segment)` values, plain integers that stay meaningful in any address
//! space. No raw pointers cross rank boundaries. Implementations are chosen
//! at composition time: [`SharedTransport`] runs ranks as threads of one
//! process; process-spanning transports implement the same trait.
//!
//! Higher layers treat a transport handle as a per-rank collaborator object
//! and thread it through every call.

mod shared;

pub use shared::SharedTransport;

use std::fmt;

use thiserror::Error;

/// One participant in the collective, indexed `0..ranks`.
pub type Rank = usize;

/// Address of a byte inside a specific rank's segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalAddr {
    pub rank: Rank,
    pub offset: u64,
}

impl GlobalAddr {
    pub fn new(rank: Rank, offset: u64) -> GlobalAddr {
        GlobalAddr { rank, offset }
    }

    /// Same rank, `delta` bytes further into the segment.
    pub fn at(self, delta: u64) -> GlobalAddr {
        GlobalAddr { rank: self.rank, offset: self.offset + delta }
    }
}

impl fmt::Display for GlobalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank, self.offset)
    }
}

/// Transport-level errors. Allocation exhaustion is reported, not fatal:
/// the caller decides whether the run can continue without that memory
/// (the heap cannot, and aborts).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rank {rank}: segment exhausted (requested {requested} bytes, {available} available)")]
    OutOfMemory { rank: Rank, requested: u64, available: u64 },

    #[error("control region exhausted (requested {requested} symmetric bytes, {available} available)")]
    OutOfControlMemory { requested: u64, available: u64 },
}

pub type Result<T> = core::result::Result<T, TransportError>;

/// Shared-segment sizing for a transport.
///
/// `segment_bytes` is each rank's whole segment; the first `control_bytes`
/// of every segment back symmetric allocations and the rest is the local
/// allocation arena.
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    pub segment_bytes: u64,
    pub control_bytes: u64,
}

impl TransportConfig {
    pub fn new(segment_bytes: u64) -> TransportConfig {
        TransportConfig { segment_bytes, control_bytes: 4096 }
    }

    pub fn control_bytes(mut self, control_bytes: u64) -> TransportConfig {
        self.control_bytes = control_bytes;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        // 16 MiB per rank covers the tests and demos comfortably.
        TransportConfig::new(16 * 1024 * 1024)
    }
}

/// One-sided communication capabilities, one handle per rank.
///
/// Atomic operations use sequentially consistent ordering, the analog of
/// the strict one-sided atomics the protocol was designed against. `put`
/// and `get` move plain bytes; their visibility to other ranks is ordered
/// by `fence` and by the atomics that bracket them.
pub trait Transport {
    /// This handle's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the collective.
    fn ranks(&self) -> usize;

    /// True collective barrier: no rank returns before all have entered.
    fn barrier(&self);

    /// Order all prior memory operations before all later ones.
    fn fence(&self);

    /// Give the transport a chance to make progress; callers sprinkle this
    /// inside poll loops. May be a no-op.
    fn progress(&self);

    /// Collective allocation from the control region. Every rank must call
    /// with the same size in the same order; all ranks receive the same
    /// offset, valid in every rank's segment. Includes a barrier.
    fn alloc_symmetric(&self, bytes: u64) -> Result<u64>;

    /// Rank-local allocation from the caller's own segment. Never blocks;
    /// other ranks are not involved.
    fn alloc_local(&self, bytes: u64) -> Result<u64>;

    /// Atomically add `delta` to the i64 at `addr`, returning the prior
    /// value. `addr.offset` must be 8-aligned.
    fn fetch_add(&self, addr: GlobalAddr, delta: i64) -> i64;

    /// Atomically replace the i64 at `addr` with `new` iff it equals
    /// `expected`; returns the value observed (== `expected` on success).
    fn compare_exchange(&self, addr: GlobalAddr, expected: i64, new: i64) -> i64;

    /// Atomic load of the i64 at `addr`.
    fn read_i64(&self, addr: GlobalAddr) -> i64;

    /// Atomic store of the i64 at `addr`.
    fn write_i64(&self, addr: GlobalAddr, value: i64);

    /// One-sided write of `src` to `addr`.
    fn put(&self, addr: GlobalAddr, src: &[u8]);

    /// One-sided read from `addr` into `dst`.
    fn get(&self, addr: GlobalAddr, dst: &mut [u8]);

    /// Largest offset any local allocation can produce; lets address
    /// encoders validate segment sizes against their bit budget up front.
    fn max_local_offset(&self) -> u64;

    /// Report a fatal condition and terminate the whole run. A rank that
    /// cannot allocate cannot safely continue a protocol the other ranks
    /// depend on.
    fn fatal(&self, msg: fmt::Arguments<'_>) -> !;
}
