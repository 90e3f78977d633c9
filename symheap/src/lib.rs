//! symheap - distributed symmetric heap for collective parallel programs
//!
//! # Purpose
//! Irregular all-to-all shuffles (parallel genomic and graph pipelines)
//! need producers to write straight into destination memory while the
//! destination has no idea how much it will receive. symheap gives every
//! rank of a fixed-size collective a growable heap that every other rank
//! can claim space on and write to one-sidedly: a single remote fetch-add
//! claims a range, the owner grows its own chain when claims start
//! failing, and a compact `HeapPos` token addresses any written byte for
//! the heap's whole lifetime.
//!
//! # Architecture
//! - [`transport`]: the one-sided seam (rank identity, barrier, remote
//!   atomics, put/get, segment allocation); [`SharedTransport`] runs ranks
//!   as threads over shared segments.
//! - [`DistHeap`]: per-rank chain of bump-allocated blocks, remote-claim
//!   puts, owner-driven growth, and a growth-draining collective barrier
//!   built on [`NonBlockingBarrier`].
//! - [`HeapIter`]: forward-only cursors over a rank's confirmed bytes.
//! - [`bootstrap`]: collective thread harness and per-rank log files.
//! - [`filemap`]: line-aligned partitioned input reading for the pipelines
//!   the heap feeds.
//!
//! # Example
//! ```
//! use symheap::{bootstrap, DistHeap, Transport, TransportConfig};
//!
//! // Four ranks, each handing its id to its right neighbor.
//! let received = bootstrap::run_collective(4, TransportConfig::default(), |t| {
//!     let ranks = t.ranks();
//!     let me = t.rank();
//!     let mut heap = DistHeap::construct(t, 1024);
//!
//!     heap.put((me + 1) % ranks, &(me as u64).to_le_bytes());
//!     heap.barrier();
//!
//!     let mut record = [0u8; 8];
//!     let mut it = heap.iterate(me);
//!     assert!(it.read_next(&mut record));
//!     heap.destroy();
//!     u64::from_le_bytes(record)
//! });
//! assert_eq!(received, vec![3, 0, 1, 2]);
//! ```

mod block;
pub mod bootstrap;
pub mod filemap;
mod heap;
mod iter;
mod nb_barrier;
mod poll;
mod pos;
pub mod transport;

pub use block::DATA_START;
pub use heap::DistHeap;
pub use iter::{HeapCursor, HeapIter};
pub use nb_barrier::NonBlockingBarrier;
pub use poll::DEFAULT_STALL_POLLS;
pub use pos::{HeapPos, MAX_OFFSET, MAX_RANKS, OFFSET_BITS, RANK_BITS};
pub use transport::{
    GlobalAddr, Rank, SharedTransport, Transport, TransportConfig, TransportError,
};
