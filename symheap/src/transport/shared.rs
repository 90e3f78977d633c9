//! In-process shared-memory transport
//!
//! # Purpose
//! The composition-time default [`Transport`]: ranks are threads of one
//! process, each owning an aligned, zero-initialized shared segment. Remote
//! atomics are `AtomicI64` views of 8-aligned segment cells; byte ranges
//! move through per-byte atomic accesses, so two ranks writing adjacent
//! claims that share a word never race.
//!
//! # Layout
//! Every segment starts with a control region of `control_bytes` backing
//! symmetric allocations (collective, same offset on every rank, the
//! lockstep analog of a collective allocator). Local allocations bump
//! monotonically upward from the end of the control region; nothing is ever
//! freed individually, the whole segment goes away with the transport.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::fmt;
use std::process;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam::utils::CachePadded;
use log::error;

use super::{GlobalAddr, Rank, Result, Transport, TransportConfig, TransportError};

fn align8(bytes: u64) -> u64 {
    (bytes + 7) & !7
}

/// One rank's shared memory region.
///
/// The allocation is 8-aligned and only ever accessed through atomics:
/// whole-i64 cells for counters, single bytes for data. The two access
/// sizes never overlap by protocol (headers and directories are i64-only,
/// data regions are byte-only).
struct Segment {
    base: *mut u8,
    layout: Layout,
    len: u64,
    /// Local allocation bump pointer; starts past the control region.
    local_next: CachePadded<AtomicU64>,
}

// SAFETY: the raw base pointer is only dereferenced through atomic
// operations with in-bounds, properly aligned offsets; the allocation lives
// as long as the Segment.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn new(len: u64, control: u64) -> Segment {
        let layout = Layout::from_size_align(len as usize, 8).expect("segment layout");
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Segment {
            base,
            layout,
            len,
            local_next: CachePadded::new(AtomicU64::new(control)),
        }
    }

    fn atomic_i64(&self, offset: u64) -> &AtomicI64 {
        assert!(
            offset % 8 == 0 && offset + 8 <= self.len,
            "bad atomic access at segment offset {offset}"
        );
        // SAFETY: in-bounds and 8-aligned (allocation is 8-aligned and the
        // offset is a multiple of 8); all access to this cell is atomic.
        unsafe { &*(self.base.add(offset as usize) as *const AtomicI64) }
    }

    fn byte(&self, offset: u64) -> &AtomicU8 {
        debug_assert!(offset < self.len);
        // SAFETY: in-bounds; u8 has no alignment requirement; all access to
        // this byte is atomic.
        unsafe { &*(self.base.add(offset as usize) as *const AtomicU8) }
    }

    fn write_bytes(&self, offset: u64, src: &[u8]) {
        assert!(
            offset + src.len() as u64 <= self.len,
            "put of {} bytes at segment offset {offset} out of bounds",
            src.len()
        );
        for (i, b) in src.iter().enumerate() {
            self.byte(offset + i as u64).store(*b, Ordering::Relaxed);
        }
    }

    fn read_bytes(&self, offset: u64, dst: &mut [u8]) {
        assert!(
            offset + dst.len() as u64 <= self.len,
            "get of {} bytes at segment offset {offset} out of bounds",
            dst.len()
        );
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.byte(offset + i as u64).load(Ordering::Relaxed);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: base/layout are exactly what alloc_zeroed returned.
        unsafe { dealloc(self.base, self.layout) };
    }
}

struct Inner {
    segments: Vec<Segment>,
    barrier: Barrier,
    config: TransportConfig,
}

/// Per-rank handle over the shared segment set.
///
/// Handles are created as a batch by [`SharedTransport::create`] and moved
/// one-per-thread; each carries its rank identity and its own symmetric
/// allocation cursor (kept in lockstep by the collective call discipline).
pub struct SharedTransport {
    inner: Arc<Inner>,
    rank: Rank,
    sym_next: Cell<u64>,
}

impl SharedTransport {
    /// Build one handle per rank over freshly allocated segments.
    ///
    /// # Panics
    /// Panics on a malformed config (zero ranks, control region larger than
    /// the segment, sizes not 8-aligned); these are programming errors,
    /// not runtime conditions.
    pub fn create(ranks: usize, config: TransportConfig) -> Vec<SharedTransport> {
        assert!(ranks > 0, "a collective needs at least one rank");
        assert!(
            config.segment_bytes % 8 == 0 && config.control_bytes % 8 == 0,
            "segment and control sizes must be 8-aligned"
        );
        assert!(
            config.segment_bytes > config.control_bytes,
            "segment leaves no room past the control region"
        );
        let segments = (0..ranks)
            .map(|_| Segment::new(config.segment_bytes, config.control_bytes))
            .collect();
        let inner = Arc::new(Inner {
            segments,
            barrier: Barrier::new(ranks),
            config,
        });
        (0..ranks)
            .map(|rank| SharedTransport {
                inner: Arc::clone(&inner),
                rank,
                sym_next: Cell::new(0),
            })
            .collect()
    }

    fn segment(&self, rank: Rank) -> &Segment {
        &self.inner.segments[rank]
    }
}

impl Transport for SharedTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn ranks(&self) -> usize {
        self.inner.segments.len()
    }

    fn barrier(&self) {
        self.inner.barrier.wait();
    }

    fn fence(&self) {
        fence(Ordering::SeqCst);
    }

    fn progress(&self) {
        thread::yield_now();
    }

    fn alloc_symmetric(&self, bytes: u64) -> Result<u64> {
        let aligned = align8(bytes);
        let offset = self.sym_next.get();
        let control = self.inner.config.control_bytes;
        if offset + aligned > control {
            return Err(TransportError::OutOfControlMemory {
                requested: bytes,
                available: control - offset,
            });
        }
        self.sym_next.set(offset + aligned);
        self.inner.barrier.wait();
        Ok(offset)
    }

    fn alloc_local(&self, bytes: u64) -> Result<u64> {
        let aligned = align8(bytes);
        let segment = self.segment(self.rank);
        let offset = segment.local_next.fetch_add(aligned, Ordering::SeqCst);
        if offset + aligned > segment.len {
            return Err(TransportError::OutOfMemory {
                rank: self.rank,
                requested: bytes,
                available: segment.len.saturating_sub(offset.min(segment.len)),
            });
        }
        Ok(offset)
    }

    fn fetch_add(&self, addr: GlobalAddr, delta: i64) -> i64 {
        self.segment(addr.rank)
            .atomic_i64(addr.offset)
            .fetch_add(delta, Ordering::SeqCst)
    }

    fn compare_exchange(&self, addr: GlobalAddr, expected: i64, new: i64) -> i64 {
        match self.segment(addr.rank).atomic_i64(addr.offset).compare_exchange(
            expected,
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(observed) | Err(observed) => observed,
        }
    }

    fn read_i64(&self, addr: GlobalAddr) -> i64 {
        self.segment(addr.rank).atomic_i64(addr.offset).load(Ordering::SeqCst)
    }

    fn write_i64(&self, addr: GlobalAddr, value: i64) {
        self.segment(addr.rank).atomic_i64(addr.offset).store(value, Ordering::SeqCst);
    }

    fn put(&self, addr: GlobalAddr, src: &[u8]) {
        self.segment(addr.rank).write_bytes(addr.offset, src);
    }

    fn get(&self, addr: GlobalAddr, dst: &mut [u8]) {
        self.segment(addr.rank).read_bytes(addr.offset, dst);
    }

    fn max_local_offset(&self) -> u64 {
        self.inner.config.segment_bytes
    }

    fn fatal(&self, msg: fmt::Arguments<'_>) -> ! {
        // The run is over for every rank; say so on both channels in case
        // no logger is installed yet.
        error!("rank {}: fatal: {msg}", self.rank);
        eprintln!("rank {}: fatal: {msg}", self.rank);
        process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_config() -> TransportConfig {
        TransportConfig::new(64 * 1024).control_bytes(512)
    }

    #[test]
    fn test_single_rank_atomics() {
        let mut transports = SharedTransport::create(1, small_config());
        let t = transports.remove(0);
        let cell = GlobalAddr::new(0, t.alloc_local(8).unwrap());

        assert_eq!(t.read_i64(cell), 0);
        assert_eq!(t.fetch_add(cell, 5), 0);
        assert_eq!(t.fetch_add(cell, 3), 5);
        assert_eq!(t.read_i64(cell), 8);

        assert_eq!(t.compare_exchange(cell, 8, 100), 8);
        assert_eq!(t.compare_exchange(cell, 8, 200), 100); // observed, not swapped
        assert_eq!(t.read_i64(cell), 100);
    }

    #[test]
    fn test_put_get_round_trip() {
        let mut transports = SharedTransport::create(1, small_config());
        let t = transports.remove(0);
        let off = t.alloc_local(32).unwrap();

        let payload = [1u8, 2, 3, 5, 8, 13, 21, 34];
        t.put(GlobalAddr::new(0, off + 3), &payload);
        let mut back = [0u8; 8];
        t.get(GlobalAddr::new(0, off + 3), &mut back);
        assert_eq!(back, payload);
    }

    #[test]
    fn test_local_alloc_is_aligned_and_bounded() {
        let mut transports = SharedTransport::create(1, small_config());
        let t = transports.remove(0);

        let a = t.alloc_local(3).unwrap();
        let b = t.alloc_local(8).unwrap();
        assert_eq!(a % 8, 0);
        assert_eq!(b, a + 8); // 3 rounds up to one 8-byte unit

        let err = t.alloc_local(1 << 40).unwrap_err();
        assert!(matches!(err, TransportError::OutOfMemory { .. }));
    }

    #[test]
    fn test_symmetric_alloc_matches_across_ranks() {
        let transports = SharedTransport::create(4, small_config());
        let offsets: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = transports
                .into_iter()
                .map(|t| {
                    s.spawn(move || {
                        let first = t.alloc_symmetric(24).unwrap();
                        let second = t.alloc_symmetric(8).unwrap();
                        (first, second)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap().1).collect()
        });
        // Same offset everywhere, and past the first 24-byte (aligned) slot.
        assert!(offsets.iter().all(|&o| o == offsets[0]));
        assert_eq!(offsets[0], 24);
    }

    #[test]
    fn test_cross_rank_put_and_fetch_add() {
        let transports = SharedTransport::create(2, small_config());
        thread::scope(|s| {
            let mut handles = Vec::new();
            for t in transports {
                handles.push(s.spawn(move || {
                    let flag = t.alloc_symmetric(8).unwrap();
                    let buf = t.alloc_symmetric(16).unwrap();
                    let me = t.rank();
                    let peer = 1 - me;

                    // Write into the peer's segment, then raise its flag.
                    t.put(GlobalAddr::new(peer, buf), &[me as u8; 16]);
                    t.fence();
                    t.fetch_add(GlobalAddr::new(peer, flag), 1);

                    // Wait for our own flag, then check our own bytes.
                    while t.read_i64(GlobalAddr::new(me, flag)) == 0 {
                        t.progress();
                    }
                    let mut got = [0u8; 16];
                    t.get(GlobalAddr::new(me, buf), &mut got);
                    assert_eq!(got, [peer as u8; 16]);
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    }
}
