//! All-to-all shuffle over the distributed symmetric heap
//!
//! Every rank pushes tagged records to pseudo-random destinations without
//! any destination knowing its incoming volume up front; the heaps start
//! deliberately small so the growth protocol carries most of the traffic.
//! After the collective barrier each rank iterates what it received,
//! verifies every record's tag, and reports per-sender counts.
//!
//! Usage: shuffle [ranks] [records-per-rank]
//! Per-rank logs land in shuffle.log.<rank>of<ranks>.

use std::env;
use std::process;

use log::{info, LevelFilter};
use serde::{Deserialize, Serialize};

use symheap::bootstrap::{self, run_collective};
use symheap::{DistHeap, Transport, TransportConfig};

/// Serialized size of [`Record`] under bincode's fixed-width integers.
const RECORD_BYTES: usize = 40;

#[derive(Serialize, Deserialize)]
struct Record {
    from: u32,
    seq: u32,
    tag: u64,
    payload: [u8; 24],
}

/// Content tag a receiver can recompute; any corruption or misdelivery
/// shows up as a mismatch.
fn tag_of(from: u32, seq: u32, payload: &[u8; 24]) -> u64 {
    let mut tag = 0xcbf2_9ce4_8422_2325u64 ^ ((from as u64) << 32 | seq as u64);
    for &b in payload {
        tag = (tag ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3);
    }
    tag
}

struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Lcg {
        Lcg(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 11
    }
}

fn usage() -> ! {
    eprintln!("usage: shuffle [ranks] [records-per-rank]");
    process::exit(2);
}

fn main() {
    let mut args = env::args().skip(1);
    let ranks: usize = args
        .next()
        .map(|s| s.parse().unwrap_or_else(|_| usage()))
        .unwrap_or(4);
    let per_rank: usize = args
        .next()
        .map(|s| s.parse().unwrap_or_else(|_| usage()))
        .unwrap_or(10_000);
    if ranks == 0 || args.next().is_some() {
        usage();
    }

    bootstrap::init_rank_logging("shuffle.log", ranks, LevelFilter::Info)
        .expect("install per-rank logging");

    let config = TransportConfig::new(64 * 1024 * 1024).control_bytes(512);
    let counts = run_collective(ranks, config, |t| {
        let me = t.rank();
        let ranks = t.ranks();
        // Small anchors on purpose: incoming volume is unknown and the
        // chains grow to fit it.
        let mut heap = DistHeap::construct(t, 4096);
        let mut lcg = Lcg::new(me as u64 + 1);

        for seq in 0..per_rank {
            let dest = lcg.next() as usize % ranks;
            let mut payload = [0u8; 24];
            for b in payload.iter_mut() {
                *b = lcg.next() as u8;
            }
            let record = Record {
                from: me as u32,
                seq: seq as u32,
                tag: tag_of(me as u32, seq as u32, &payload),
                payload,
            };
            let bytes = bincode::serialize(&record).expect("serialize record");
            debug_assert_eq!(bytes.len(), RECORD_BYTES);
            heap.put(dest, &bytes);
        }
        heap.barrier();

        let mut it = heap.iterate(me);
        let mut buf = [0u8; RECORD_BYTES];
        let mut from_counts = vec![0u64; ranks];
        let mut corrupt = 0u64;
        while it.read_next(&mut buf) {
            let record: Record = bincode::deserialize(&buf).expect("deserialize record");
            if record.tag != tag_of(record.from, record.seq, &record.payload) {
                corrupt += 1;
            }
            from_counts[record.from as usize] += 1;
        }

        info!(
            "rank {me}: received {} records ({corrupt} corrupt) in {} blocks, {} stall events",
            from_counts.iter().sum::<u64>(),
            heap.block_count(me),
            heap.stall_events()
        );
        assert_eq!(corrupt, 0, "rank {me} received corrupt records");
        heap.destroy();
        from_counts
    });

    let delivered: u64 = counts.iter().flatten().sum();
    println!("shuffled {delivered} records across {ranks} ranks ({per_rank} sent per rank)");
    for (rank, from_counts) in counts.iter().enumerate() {
        println!("  rank {rank} received {:6} records {from_counts:?}", from_counts.iter().sum::<u64>());
    }
    assert_eq!(delivered, (ranks * per_rank) as u64);
}
