//! Collective bootstrap and per-rank logging
//!
//! # Purpose
//! Startup and shutdown for in-process collectives: build the transport
//! set, run one closure per rank on its own thread, join in rank order.
//! Also the logging sink the rest of the crate assumes: one log file per
//! rank, named `<prefix>.<rank>of<ranks>`, routed by a thread-registered
//! rank id so interleaved output from many ranks stays readable.

use std::cell::Cell;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use thiserror::Error;

use crate::transport::{Rank, SharedTransport, TransportConfig};

thread_local! {
    static CURRENT_RANK: Cell<Option<Rank>> = const { Cell::new(None) };
}

/// Tie the calling thread to a rank for log routing. The collective
/// harness does this for every rank thread it spawns; embeddings that
/// manage their own threads call it once per rank thread.
pub fn register_rank(rank: Rank) {
    CURRENT_RANK.with(|r| r.set(Some(rank)));
}

/// Rank registered for the calling thread, if any.
pub fn current_rank() -> Option<Rank> {
    CURRENT_RANK.with(|r| r.get())
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cannot open per-rank log file {path}: {source}")]
    LogFile { path: String, source: io::Error },

    #[error("a global logger is already installed")]
    LoggerInstalled(#[from] SetLoggerError),
}

pub type Result<T> = core::result::Result<T, BootstrapError>;

/// Run `f` once per rank over a fresh shared transport, one thread per
/// rank, and return every rank's result in rank order.
///
/// # Panics
/// Panics if any rank panics; the collective is only as healthy as its
/// sickest member.
pub fn run_collective<F, R>(ranks: usize, config: TransportConfig, f: F) -> Vec<R>
where
    F: Fn(SharedTransport) -> R + Sync,
    R: Send,
{
    let transports = SharedTransport::create(ranks, config);
    crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = transports
            .into_iter()
            .enumerate()
            .map(|(rank, transport)| {
                let f = &f;
                scope
                    .builder()
                    .name(format!("rank-{rank}"))
                    .spawn(move |_| {
                        register_rank(rank);
                        f(transport)
                    })
                    .expect("spawn rank thread")
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| handle.join().unwrap_or_else(|_| panic!("rank {rank} panicked")))
            .collect()
    })
    .expect("collective scope failed")
}

/// Logger writing each rank's records to its own file.
struct RankLogger {
    start: Instant,
    sinks: Vec<Mutex<File>>,
}

impl Log for RankLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{:>9.3}s {:5}] {}\n",
            self.start.elapsed().as_secs_f64(),
            record.level(),
            record.args()
        );
        match current_rank() {
            Some(rank) if rank < self.sinks.len() => {
                if let Ok(mut sink) = self.sinks[rank].lock() {
                    let _ = sink.write_all(line.as_bytes());
                }
            }
            // Unregistered threads (or out-of-range ranks) fall back to
            // stderr rather than losing the record.
            _ => {
                let _ = io::stderr().write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            if let Ok(mut sink) = sink.lock() {
                let _ = sink.flush();
            }
        }
    }
}

/// Install the per-rank file logger: rank r writes to
/// `<prefix>.<r>of<ranks>`. Call once, before spawning the collective.
pub fn init_rank_logging(prefix: &str, ranks: usize, level: LevelFilter) -> Result<()> {
    let sinks = (0..ranks)
        .map(|rank| {
            let path = format!("{prefix}.{rank}of{ranks}");
            File::create(&path)
                .map(Mutex::new)
                .map_err(|source| BootstrapError::LogFile { path, source })
        })
        .collect::<Result<Vec<_>>>()?;
    log::set_boxed_logger(Box::new(RankLogger { start: Instant::now(), sinks }))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    fn config() -> TransportConfig {
        TransportConfig::new(4096).control_bytes(256)
    }

    #[test]
    fn test_results_come_back_in_rank_order() {
        let results = run_collective(4, config(), |t| t.rank() * 10);
        assert_eq!(results, vec![0, 10, 20, 30]);
    }

    #[test]
    fn test_every_rank_sees_the_same_collective() {
        let results = run_collective(3, config(), |t| {
            t.barrier();
            (t.rank(), t.ranks())
        });
        assert_eq!(results, vec![(0, 3), (1, 3), (2, 3)]);
    }

    #[test]
    fn test_rank_registration_is_per_thread() {
        run_collective(2, config(), |t| {
            assert_eq!(current_rank(), Some(t.rank()));
        });
        assert_eq!(current_rank(), None);
    }
}
