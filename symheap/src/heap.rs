//! Distributed symmetric heap
//!
//! # Purpose
//! Lets every rank of a fixed-size collective allocate memory that any
//! other rank can claim and write one-sidedly, without the destination
//! knowing in advance how much it will receive. Producers bump-claim space
//! on the destination's active block with a single remote fetch-add; when a
//! block runs out, the producer flags a growth request and the owner, and
//! only the owner, appends a larger block to its chain.
//!
//! # Architecture
//! Per rank: a directory at a symmetric segment offset (anchor block,
//! active block, pending growth request) and an append-only chain of blocks
//! carved from the rank's local segment arena. The anchor block never
//! moves, which makes `(rank, offset-from-anchor)` tokens stable across any
//! amount of growth. Claims are totally ordered by the fetch-add sequence;
//! the corresponding writes may land and confirm out of claim order, so
//! `confirmed` counts landed bytes and is only trustworthy after a barrier.
//!
//! # Growth protocol
//! A failed claim compare-exchanges the destination's pending request from
//! 0 to the wanted byte count and retries; the overshooting fetch-add is
//! deliberately not rolled back (rolling back races with other claimers;
//! the wasted tail is bounded by one claim per grower round). Each rank
//! periodically calls [`DistHeap::service_growth`] on its own heap; growth
//! doubles against the request so repeated shortfalls amortize away.

use std::cell::Cell;

use log::{debug, info};

use crate::block::{BlockHeader, DATA_START, HEADER_BYTES, NO_BLOCK, OFF_CLAIM, OFF_CONFIRMED, OFF_NEWER, OFF_OLDER, OFF_SIZE};
use crate::nb_barrier::NonBlockingBarrier;
use crate::poll::{Poller, DEFAULT_STALL_POLLS};
use crate::pos::{HeapPos, MAX_OFFSET, MAX_RANKS, OFFSET_BITS};
use crate::transport::{GlobalAddr, Rank, Transport};

// Directory fields, at the heap's symmetric offset in every segment.
const DIR_ANCHOR: u64 = 0;
const DIR_ACTIVE: u64 = 8;
const DIR_PENDING: u64 = 16;
const DIR_BYTES: u64 = 24;

/// Per-rank handle to the collective heap.
///
/// Constructed and destroyed collectively; every rank holds exactly one
/// handle and threads it through all heap calls. The handle owns the rank's
/// transport handle; [`DistHeap::destroy`] gives it back, so use after
/// destroy is unrepresentable.
pub struct DistHeap<T: Transport> {
    transport: T,
    /// Symmetric offset of this heap's directory.
    dir: u64,
    /// Every rank's anchor block offset, cached at construction; anchors
    /// never move for the lifetime of the heap.
    anchors: Vec<u64>,
    nbb: NonBlockingBarrier,
    stall_polls: u64,
    stall_events: Cell<u64>,
}

/// A successful remote claim: where to write, and which block to confirm.
struct Claim {
    /// Segment offset of the claimed block on the destination rank.
    block: u64,
    /// Segment offset of the first claimed byte.
    at: u64,
}

/// Allocate and publish one block with `usable` data bytes on the calling
/// rank. Fatal on exhaustion: a rank that cannot allocate cannot safely
/// continue a protocol the other ranks depend on.
fn alloc_block<T: Transport>(transport: &T, usable: u64, anchor: Option<u64>, next_older: i64) -> u64 {
    let block = transport.alloc_local(HEADER_BYTES + usable).unwrap_or_else(|e| {
        transport.fatal(format_args!(
            "rank {}: cannot allocate a heap block of {usable} data bytes: {e}",
            transport.rank()
        ))
    });
    // Local allocation is monotonic, so any block sits at or above its
    // anchor and the anchor-relative distance is non-negative.
    let anchor_rel = anchor.map_or(0, |a| block - a);
    BlockHeader::new(usable, anchor_rel, next_older).store(transport, block);
    transport.fence();
    block
}

impl<T: Transport> DistHeap<T> {
    /// Collective constructor: every rank allocates an anchor block of
    /// `local_size` usable bytes (ranks may pass differing sizes) and
    /// publishes it, then all anchors are cached on all ranks.
    pub fn construct(transport: T, local_size: u64) -> DistHeap<T> {
        let ranks = transport.ranks();
        let me = transport.rank();
        if ranks > MAX_RANKS {
            transport.fatal(format_args!(
                "{ranks} ranks exceed the {MAX_RANKS} representable in a heap position"
            ));
        }
        if transport.max_local_offset() > MAX_OFFSET {
            transport.fatal(format_args!(
                "segment of {} bytes exceeds the {OFFSET_BITS}-bit offset budget of a heap position",
                transport.max_local_offset()
            ));
        }

        let dir = transport.alloc_symmetric(DIR_BYTES).unwrap_or_else(|e| {
            transport.fatal(format_args!("cannot allocate the heap directory: {e}"))
        });
        let nbb = NonBlockingBarrier::new(&transport);

        let anchor = alloc_block(&transport, local_size, None, NO_BLOCK);
        transport.write_i64(GlobalAddr::new(me, dir + DIR_ANCHOR), anchor as i64);
        transport.write_i64(GlobalAddr::new(me, dir + DIR_ACTIVE), anchor as i64);
        transport.write_i64(GlobalAddr::new(me, dir + DIR_PENDING), 0);
        transport.fence();
        transport.barrier();

        let anchors = (0..ranks)
            .map(|r| transport.read_i64(GlobalAddr::new(r, dir + DIR_ANCHOR)) as u64)
            .collect();
        info!("rank {me}: constructed heap, {local_size} local bytes across {ranks} ranks");

        DistHeap {
            transport,
            dir,
            anchors,
            nbb,
            stall_polls: DEFAULT_STALL_POLLS,
            stall_events: Cell::new(0),
        }
    }

    /// Collective destructor. Unlinks and poisons the rank's whole chain at
    /// once, clears the directory, and returns the transport handle for
    /// reuse. Segment memory is reclaimed with the transport itself.
    pub fn destroy(mut self) -> T {
        // Quiesce: no in-flight puts or unserviced growth may survive.
        self.barrier();

        let me = self.transport.rank();
        let mut block = self.transport.read_i64(self.dir_active(me));
        while block != NO_BLOCK {
            let off = block as u64;
            let older = self.transport.read_i64(GlobalAddr::new(me, off + OFF_OLDER));
            // Poison so a stale cursor fails loudly instead of reading junk.
            self.transport.write_i64(GlobalAddr::new(me, off + OFF_SIZE), 0);
            self.transport.write_i64(GlobalAddr::new(me, off + OFF_OLDER), NO_BLOCK);
            self.transport.write_i64(GlobalAddr::new(me, off + OFF_NEWER), NO_BLOCK);
            block = older;
        }
        self.transport.write_i64(self.dir_anchor(me), NO_BLOCK);
        self.transport.write_i64(self.dir_active(me), NO_BLOCK);
        self.transport.write_i64(self.dir_pending(me), 0);
        self.transport.fence();
        self.transport.barrier();
        debug!("rank {me}: destroyed heap");
        self.transport
    }

    fn dir_anchor(&self, rank: Rank) -> GlobalAddr {
        GlobalAddr::new(rank, self.dir + DIR_ANCHOR)
    }

    fn dir_active(&self, rank: Rank) -> GlobalAddr {
        GlobalAddr::new(rank, self.dir + DIR_ACTIVE)
    }

    fn dir_pending(&self, rank: Rank) -> GlobalAddr {
        GlobalAddr::new(rank, self.dir + DIR_PENDING)
    }

    /// Try to claim `bytes` on `dest`'s active block.
    ///
    /// One remote fetch-add decides; the pre-update value plus `bytes` must
    /// stay within the block. On any failure the destination's pending
    /// growth request is raised (compare-exchange from 0, so a request
    /// already pending is left alone) and the claim is NOT rolled back:
    /// correcting the overshoot would race with concurrent claimers, and
    /// the wasted tail is bounded.
    fn try_claim(&self, dest: Rank, bytes: i64) -> Option<Claim> {
        let t = &self.transport;
        let active = t.read_i64(self.dir_active(dest)) as u64;
        let hdr = BlockHeader::fetch(t, dest, active);
        if hdr.claim + bytes <= hdr.size {
            let claimed = t.fetch_add(GlobalAddr::new(dest, active + OFF_CLAIM), bytes);
            if claimed + bytes <= hdr.size {
                return Some(Claim { block: active, at: active + claimed as u64 });
            }
            debug!(
                "rank {}: raced out of space on rank {dest} (got {claimed} of {}), requesting {bytes} bytes",
                t.rank(),
                hdr.size
            );
        } else {
            debug!(
                "rank {}: active block on rank {dest} is full ({} of {} claimed), requesting {bytes} bytes",
                t.rank(),
                hdr.claim,
                hdr.size
            );
        }
        t.compare_exchange(self.dir_pending(dest), 0, bytes);
        t.progress();
        None
    }

    /// One put attempt: claim, one-sided write, fence, confirm.
    ///
    /// Returns the position of the written bytes, or `None` when the
    /// destination's active block was full; the growth request has been
    /// raised and the caller should retry. Every attempt also services the
    /// caller's own growth requests, so a rank putting to itself cannot
    /// deadlock. An empty `data` returns the null token without touching
    /// the destination.
    pub fn try_put(&self, dest: Rank, data: &[u8]) -> Option<HeapPos> {
        if data.is_empty() {
            return Some(HeapPos::NULL);
        }
        let bytes = data.len() as i64;
        let pos = self.try_claim(dest, bytes).map(|claim| {
            let t = &self.transport;
            t.put(GlobalAddr::new(dest, claim.at), data);
            t.fence();
            t.fetch_add(GlobalAddr::new(dest, claim.block + OFF_CONFIRMED), bytes);
            self.encode(GlobalAddr::new(dest, claim.at))
        });
        self.service_growth();
        pos
    }

    /// Put `data` on `dest`, retrying until it lands.
    ///
    /// Interleaves local growth servicing and a transport yield between
    /// attempts; progress depends on `dest` servicing its own heap. Long
    /// waits raise the stalled observable (see [`DistHeap::stall_events`])
    /// but never a timeout.
    pub fn put(&self, dest: Rank, data: &[u8]) -> HeapPos {
        let mut poller = Poller::new("put", self.transport.rank(), self.stall_polls);
        loop {
            if let Some(pos) = self.try_put(dest, data) {
                return pos;
            }
            self.transport.progress();
            if poller.tick() {
                self.stall_events.set(self.stall_events.get() + 1);
            }
        }
    }

    /// Service this rank's pending growth request, if any. Rank-local and
    /// non-blocking; a no-op when nothing is pending. Must be called
    /// periodically by every rank that receives data: growth is
    /// owner-driven, no rank can grow another's heap.
    pub fn service_growth(&self) {
        let t = &self.transport;
        t.progress();
        let me = t.rank();
        let pending = t.read_i64(self.dir_pending(me));
        if pending == 0 {
            return;
        }

        let active = t.read_i64(self.dir_active(me)) as u64;
        let hdr = BlockHeader::fetch(t, me, active);
        let grow = hdr.usable().max(pending * 2) as u64;
        let block = alloc_block(t, grow, Some(self.anchors[me]), active as i64);

        // Publish the forward link before the new active block: an iterator
        // must be able to reach any block whose data is visible.
        t.write_i64(GlobalAddr::new(me, active + OFF_NEWER), block as i64);
        t.fence();
        t.write_i64(self.dir_active(me), block as i64);
        // Clear exactly the request we serviced; a newer racing request
        // would fail the exchange and get serviced on the next call.
        t.compare_exchange(self.dir_pending(me), pending, 0);
        t.fence();
        info!("rank {me}: grew heap with a {grow}-byte block after a {pending}-byte request");
    }

    /// Collective barrier that keeps draining growth while waiting.
    ///
    /// Loops `service_growth` + non-blocking arrival until every rank has
    /// arrived, then runs one true collective barrier before resetting the
    /// arrival marks, and one after: no rank may start a new round while
    /// a peer still observes this round's marks.
    pub fn barrier(&mut self) {
        let mut poller = Poller::new("heap barrier", self.transport.rank(), self.stall_polls);
        loop {
            self.service_growth();
            if self.nbb.try_arrive(&self.transport) == self.transport.ranks() {
                break;
            }
            self.transport.progress();
            if poller.tick() {
                self.stall_events.set(self.stall_events.get() + 1);
            }
        }
        self.transport.barrier();
        self.nbb.reset(&self.transport);
        self.transport.barrier();
    }

    /// Encode a raw address as a portable position token. Fatal if the
    /// anchor-relative offset exceeds the token's bit budget, meaning the
    /// heap was configured larger than the address format can describe.
    pub fn encode(&self, addr: GlobalAddr) -> HeapPos {
        let rel = addr.offset - self.anchors[addr.rank];
        HeapPos::pack(addr.rank, rel).unwrap_or_else(|| {
            self.transport.fatal(format_args!(
                "rank {}: offset {rel} from rank {}'s anchor exceeds the heap position budget",
                self.transport.rank(),
                addr.rank
            ))
        })
    }

    /// Resolve a position token back to its raw address. Pure; valid for
    /// the heap's whole lifetime regardless of growth since encoding.
    pub fn decode(&self, pos: HeapPos) -> GlobalAddr {
        debug_assert!(!pos.is_null(), "cannot decode the null position");
        GlobalAddr::new(pos.rank(), self.anchors[pos.rank()] + pos.offset())
    }

    /// One-sided read of previously put bytes.
    ///
    /// The bytes are only guaranteed complete if a barrier separated the
    /// put from this read, or the reader otherwise knows the write landed
    /// (e.g. it performed it).
    pub fn read(&self, pos: HeapPos, dst: &mut [u8]) {
        self.transport.get(self.decode(pos), dst);
    }

    /// Sum of confirmed data bytes across `rank`'s whole chain.
    pub fn confirmed_bytes(&self, rank: Rank) -> u64 {
        let mut total = 0;
        let mut block = self.anchors[rank] as i64;
        while block != NO_BLOCK {
            let hdr = BlockHeader::fetch(&self.transport, rank, block as u64);
            total += (hdr.confirmed - DATA_START as i64) as u64;
            block = hdr.next_newer;
        }
        total
    }

    /// Number of blocks in `rank`'s chain.
    pub fn block_count(&self, rank: Rank) -> usize {
        let mut count = 0;
        let mut block = self.anchors[rank] as i64;
        while block != NO_BLOCK {
            count += 1;
            block = self.transport.read_i64(GlobalAddr::new(rank, block as u64 + OFF_NEWER));
        }
        count
    }

    /// Times a poll loop on this handle crossed the stall threshold.
    pub fn stall_events(&self) -> u64 {
        self.stall_events.get()
    }

    /// Poll iterations between stall warnings; 0 disables the observable.
    pub fn set_stall_polls(&mut self, polls: u64) {
        self.stall_polls = polls;
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn ranks(&self) -> usize {
        self.transport.ranks()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn anchor_of(&self, rank: Rank) -> u64 {
        self.anchors[rank]
    }

    pub(crate) fn active_of(&self, rank: Rank) -> u64 {
        self.transport.read_i64(self.dir_active(rank)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SharedTransport, TransportConfig};

    fn single_rank_heap(local_size: u64) -> DistHeap<SharedTransport> {
        let mut transports =
            SharedTransport::create(1, TransportConfig::new(64 * 1024).control_bytes(256));
        DistHeap::construct(transports.remove(0), local_size)
    }

    #[test]
    fn test_construct_publishes_anchor_as_active() {
        let heap = single_rank_heap(1024);
        assert_eq!(heap.anchor_of(0), heap.active_of(0));
        assert_eq!(heap.block_count(0), 1);
        assert_eq!(heap.confirmed_bytes(0), 0);
    }

    #[test]
    fn test_self_put_and_read_back() {
        let heap = single_rank_heap(1024);
        let payload = b"irregular all-to-all";
        let pos = heap.try_put(0, payload).expect("anchor block has room");

        let mut back = vec![0u8; payload.len()];
        heap.read(pos, &mut back);
        assert_eq!(&back, payload);
        assert_eq!(heap.confirmed_bytes(0), payload.len() as u64);
    }

    #[test]
    fn test_positions_round_trip_through_encode() {
        let heap = single_rank_heap(1024);
        let pos = heap.try_put(0, &[7u8; 24]).unwrap();
        let addr = heap.decode(pos);
        assert_eq!(heap.encode(addr), pos);
    }

    #[test]
    fn test_empty_put_returns_null_without_claiming() {
        let heap = single_rank_heap(1024);
        assert_eq!(heap.try_put(0, &[]), Some(HeapPos::NULL));
        assert_eq!(heap.confirmed_bytes(0), 0);
    }

    #[test]
    fn test_service_growth_without_pending_is_idle() {
        let heap = single_rank_heap(1024);
        for _ in 0..10 {
            heap.service_growth();
        }
        assert_eq!(heap.block_count(0), 1);
    }

    #[test]
    fn test_full_block_raises_request_and_grows() {
        let heap = single_rank_heap(8);

        // The anchor holds exactly one 8-byte record.
        assert!(heap.try_put(0, &[1u8; 8]).is_some());
        assert_eq!(heap.block_count(0), 1);

        // The next attempt fails and raises a request, which the try_put
        // tail services immediately, so the chain grows by one block.
        assert!(heap.try_put(0, &[2u8; 8]).is_none());
        assert!(heap.block_count(0) >= 2);
        let pos = heap.put(0, &[2u8; 8]);
        assert!(!pos.is_null());
        assert!(heap.block_count(0) >= 2);
        assert_eq!(heap.confirmed_bytes(0), 16);
    }

    #[test]
    fn test_oversized_put_grows_until_it_fits() {
        let heap = single_rank_heap(8);
        // 64 bytes can never fit the 8-byte anchor; growth doubles against
        // the request, so one cycle suffices.
        let pos = heap.put(0, &[9u8; 64]);
        let mut back = [0u8; 64];
        heap.read(pos, &mut back);
        assert_eq!(back, [9u8; 64]);
        assert!(heap.block_count(0) >= 2);
    }

    #[test]
    fn test_destroy_returns_transport() {
        let heap = single_rank_heap(1024);
        let transport = heap.destroy();
        assert_eq!(transport.ranks(), 1);
    }
}
