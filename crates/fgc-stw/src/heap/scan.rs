//! Chunk Scanning - Card-driven and parallel traversal of object runs
//!
//! Two ways of turning table state into object runs for the collector:
//!
//! 1. [`scan_dirty_cards`] - sequential: for every dirty card, find the START
//!    chunk of the run containing it, visit `[run_start, run_end)` and mark the
//!    run SCAVENGED so later dirty cards in the same run are skipped.
//! 2. [`ParallelChunkScanner`] - N scoped workers race over the side table,
//!    each claiming START chunks with the side table CAS. Every run is visited
//!    by exactly one worker.

use super::card_table::CardTable;
use super::side_table::ChunkSideTable;
use crate::config::StwConfig;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Visit every object run that overlaps a dirty card in `cards`
///
/// Both tables must cover the same region. Returns the number of runs visited.
pub fn scan_dirty_cards<F>(
    cards: &CardTable,
    chunks: &ChunkSideTable,
    indices: Range<usize>,
    mut visit: F,
) -> usize
where
    F: FnMut(usize, usize),
{
    debug_assert_eq!(cards.covered_region(), chunks.covered_region());

    let mut visited = 0;
    for card in cards.dirty_cards(indices) {
        let address = cards.heap_address_from_card_index(card);
        if let Some(run_start) = chunks.find_start(address) {
            let run_end = chunks.chunk_end(run_start);
            visit(run_start, run_end);
            chunks.mark_scavenged(run_start);
            visited += 1;
        }
    }
    visited
}

/// ParallelChunkScanner - claims object runs across worker threads
///
/// # Examples
///
/// ```rust
/// use fgc_stw::heap::{ChunkSideTable, HeapRegion, ParallelChunkScanner};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let table = ChunkSideTable::try_new(HeapRegion::new(0x100000, 64 * 512)?)?;
/// for i in (0..64).step_by(4) {
///     table.mark_start(table.heap_address_from_chunk_index(i));
/// }
///
/// let bytes = AtomicUsize::new(0);
/// let claimed = ParallelChunkScanner::new(4).scan(&table, 0..64, |start, end| {
///     bytes.fetch_add(end - start, Ordering::Relaxed);
/// });
/// assert_eq!(claimed, 16);
/// assert_eq!(bytes.load(Ordering::Relaxed), 64 * 512);
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ParallelChunkScanner {
    workers: usize,
}

impl ParallelChunkScanner {
    /// Create scanner with the given worker count (at least one)
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Create scanner sized by `StwConfig::scanner_workers`
    pub fn from_config(config: &StwConfig) -> Self {
        Self::new(config.scanner_workers)
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Claim and visit every START chunk in a half-open index range
    ///
    /// `visit` receives `[run_start, run_end)` for each claimed run and may be
    /// called from any worker. Returns the number of runs claimed.
    pub fn scan<F>(&self, table: &ChunkSideTable, indices: Range<usize>, visit: F) -> usize
    where
        F: Fn(usize, usize) + Sync,
    {
        let end = indices.end.min(table.chunk_count());
        let start = indices.start.min(end);
        let span = end - start;
        if span == 0 {
            return 0;
        }

        let claimed = AtomicUsize::new(0);
        let stripe = span.div_ceil(self.workers);

        let outcome = crossbeam::scope(|scope| {
            for worker in 0..self.workers {
                let claimed = &claimed;
                let visit = &visit;
                let offset = (start + worker * stripe).min(end);

                scope.spawn(move |_| {
                    // Own stripe first, then help with everything before it.
                    for range in [offset..end, start..offset] {
                        let mut cursor = range.start;
                        while let Some(run_start) = table.claim_next(cursor..range.end) {
                            visit(run_start, table.chunk_end(run_start));
                            claimed.fetch_add(1, Ordering::Relaxed);
                            cursor = table.chunk_index(run_start) + 1;
                        }
                    }
                });
            }
        });

        if let Err(panic) = outcome {
            std::panic::resume_unwind(panic);
        }

        let claimed = claimed.load(Ordering::Relaxed);
        log::debug!(
            "Parallel scan claimed {} runs in chunks {}..{} with {} workers",
            claimed,
            start,
            end,
            self.workers
        );
        claimed
    }
}
