//! Chunk Side Table - Object-origin and scavenge-state tracking
//!
//! One machine word per 512-byte chunk, indexed exactly like the card table.
//! It lets a scan pass find where objects start inside a dirty card without a
//! linear walk, and lets concurrent scanners claim each chunk exactly once.
//!
//! ## Chunk States
//!
//! ```text
//!               allocator                      allocator
//!   MIDDLE ───────────────> CREATING ──────────────────> START
//!     ^         (reserve)          (publish, release store)   │
//!     │                                                       │ scanner CAS
//!     │ reset                                                 ▼ (exactly one winner)
//!     └──────────────────────────────────────────────── SCAVENGED
//!                                  restore_all() between cycles: SCAVENGED -> START
//! ```
//!
//! Only `compare_and_swap_start` races. Every other transition is performed by
//! the allocating thread or by the collector while the world is stopped.

use super::storage::TableStorage;
use super::HeapRegion;
use crate::error::Result;
use crate::logging::{self, StwEvent};
use crate::util::constants::{GRANULE_SHIFT, GRANULE_SIZE, WORD_SIZE};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// log2 of the chunk size
pub const CHUNK_SHIFT: u32 = GRANULE_SHIFT;

/// Bytes covered by one chunk
pub const CHUNK_SIZE: usize = GRANULE_SIZE;

/// State of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ChunkState {
    /// Interior of an object run, or unused
    Middle = 0,
    /// Holds a live, not yet scavenged object origin
    Start = 1,
    /// Object under construction; never a scan root
    Creating = 2,
    /// Consumed by a scanner this cycle
    Scavenged = 3,
}

impl ChunkState {
    #[inline]
    fn from_word(word: usize) -> Self {
        match word {
            1 => ChunkState::Start,
            2 => ChunkState::Creating,
            3 => ChunkState::Scavenged,
            _ => {
                debug_assert_eq!(word, 0, "corrupt side table word {:#x}", word);
                ChunkState::Middle
            },
        }
    }

    fn label(self) -> &'static str {
        match self {
            ChunkState::Middle => "MIDDLE",
            ChunkState::Start => "START",
            ChunkState::Creating => "CREATING",
            ChunkState::Scavenged => "SCAVENGED",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// ChunkSideTable - word-per-chunk state table
///
/// # Examples
///
/// ```rust
/// use fgc_stw::heap::{ChunkSideTable, ChunkState, HeapRegion};
///
/// let region = HeapRegion::new(0x10000, 2000)?;
/// let table = ChunkSideTable::try_new(region)?;
/// assert_eq!(table.chunk_count(), 4);
///
/// let chunk2 = table.heap_address_from_chunk_index(2);
/// table.mark_start(chunk2);
/// assert_eq!(table.compare_and_swap_start(chunk2), ChunkState::Start);
/// assert_eq!(table.compare_and_swap_start(chunk2), ChunkState::Scavenged);
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
pub struct ChunkSideTable {
    /// Region whose chunks this table tracks
    region: HeapRegion,

    /// One word per chunk
    storage: TableStorage,
}

impl ChunkSideTable {
    /// Create a side table, aborting the process if storage cannot be mapped
    pub fn new(region: HeapRegion) -> Self {
        crate::or_fatal!(Self::try_new(region))
    }

    /// Create a side table over anonymous mapped storage
    ///
    /// All chunks start MIDDLE.
    pub fn try_new(region: HeapRegion) -> Result<Self> {
        let storage = TableStorage::anonymous("side table", region.granule_count() * WORD_SIZE)?;
        Ok(Self::initialize(region, storage))
    }

    /// Create a side table in caller-provided storage
    ///
    /// # Safety
    /// `storage` must be word aligned, valid for `region.granule_count()`
    /// words, outlive the table, and not be accessed by anything else while
    /// the table exists.
    pub unsafe fn with_storage(region: HeapRegion, storage: *mut usize) -> Self {
        let storage =
            TableStorage::external(storage as *mut u8, region.granule_count() * WORD_SIZE);
        Self::initialize(region, storage)
    }

    fn initialize(region: HeapRegion, storage: TableStorage) -> Self {
        let table = Self { region, storage };
        table.reset_all();
        log::debug!(
            "Side table covering {} with {} chunks at {:#x}",
            region,
            table.chunk_count(),
            table.storage.base()
        );
        table
    }

    #[inline]
    fn slots(&self) -> &[AtomicUsize] {
        self.storage.words()
    }

    /// Number of chunk slots
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.slots().len()
    }

    /// Region covered by this table
    pub fn covered_region(&self) -> HeapRegion {
        self.region
    }

    /// Chunk index for a covered address
    ///
    /// No range check: callers guarantee the address is covered.
    #[inline]
    pub fn chunk_index(&self, address: usize) -> usize {
        address.wrapping_sub(self.region.start()) >> CHUNK_SHIFT
    }

    /// First heap address of a chunk
    #[inline]
    pub fn heap_address_from_chunk_index(&self, index: usize) -> usize {
        self.region.start() + (index << CHUNK_SHIFT)
    }

    /// Current state of a chunk
    ///
    /// Acquire load: a START observed here guarantees the object header
    /// written before `mark_start` is visible.
    #[inline]
    pub fn state(&self, index: usize) -> ChunkState {
        ChunkState::from_word(self.slots()[index].load(Ordering::Acquire))
    }

    #[inline]
    fn store(&self, address: usize, state: ChunkState, order: Ordering) {
        self.slots()[self.chunk_index(address)].store(state as usize, order);
    }

    /// Publish the object starting in this chunk
    ///
    /// Release store; call only after the object header is fully written.
    #[inline]
    pub fn mark_start(&self, address: usize) {
        self.store(address, ChunkState::Start, Ordering::Release);
    }

    /// Mark the chunk as holding an object under construction
    #[inline]
    pub fn mark_creating(&self, address: usize) {
        self.store(address, ChunkState::Creating, Ordering::Relaxed);
    }

    /// Mark the chunk as interior/unused
    #[inline]
    pub fn mark_middle(&self, address: usize) {
        self.store(address, ChunkState::Middle, Ordering::Relaxed);
    }

    /// Mark the chunk as consumed by a scan pass
    #[inline]
    pub fn mark_scavenged(&self, address: usize) {
        self.store(address, ChunkState::Scavenged, Ordering::Release);
    }

    /// Promote a CREATING chunk to START once its object is initialized
    ///
    /// Returns `false` (and leaves the slot alone) if the chunk was not CREATING.
    pub fn publish(&self, address: usize) -> bool {
        self.slots()[self.chunk_index(address)]
            .compare_exchange(
                ChunkState::Creating as usize,
                ChunkState::Start as usize,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Try to claim a chunk: START -> SCAVENGED
    ///
    /// Returns the state observed before the attempt. Exactly one concurrent
    /// caller sees `Start`; the others see `Scavenged`.
    #[inline]
    pub fn compare_and_swap_start(&self, address: usize) -> ChunkState {
        self.compare_and_swap_start_at(self.chunk_index(address))
    }

    /// Index form of [`compare_and_swap_start`](Self::compare_and_swap_start)
    #[inline]
    pub fn compare_and_swap_start_at(&self, index: usize) -> ChunkState {
        match self.slots()[index].compare_exchange(
            ChunkState::Start as usize,
            ChunkState::Scavenged as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) => ChunkState::from_word(previous),
            Err(actual) => ChunkState::from_word(actual),
        }
    }

    /// Check if chunk holds an unclaimed object origin
    #[inline]
    pub fn is_start(&self, index: usize) -> bool {
        self.state(index) == ChunkState::Start
    }

    /// Check if chunk is interior/unused
    #[inline]
    pub fn is_middle(&self, index: usize) -> bool {
        self.state(index) == ChunkState::Middle
    }

    /// Check if chunk was consumed this cycle
    #[inline]
    pub fn is_scavenged(&self, index: usize) -> bool {
        self.state(index) == ChunkState::Scavenged
    }

    /// Check if chunk holds an object under construction
    #[inline]
    pub fn is_creating(&self, index: usize) -> bool {
        self.state(index) == ChunkState::Creating
    }

    /// Return every SCAVENGED chunk to START
    ///
    /// Run once per cycle between the scan pass and the next mutation epoch.
    /// Other states are left unchanged. Returns the number of chunks restored.
    pub fn restore_all(&self) -> usize {
        let mut restored = 0;
        for slot in self.slots() {
            if slot
                .compare_exchange(
                    ChunkState::Scavenged as usize,
                    ChunkState::Start as usize,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                restored += 1;
            }
        }
        logging::log_event(StwEvent::ChunksRestored { restored });
        restored
    }

    /// Reset every chunk to MIDDLE
    pub fn reset_all(&self) {
        for slot in self.slots() {
            slot.store(ChunkState::Middle as usize, Ordering::Relaxed);
        }
    }

    /// Reset chunks for heap addresses `[start, end)` to MIDDLE
    ///
    /// Half-open in chunk indices, as for [`CardTable::clear_range`](super::CardTable::clear_range).
    pub fn clear_range(&self, start: usize, end: usize) {
        let first = self.chunk_index(start);
        let last = if end >= self.region.end() {
            self.chunk_count()
        } else {
            self.chunk_index(end)
        };
        for slot in self.slots().iter().take(last).skip(first) {
            slot.store(ChunkState::Middle as usize, Ordering::Relaxed);
        }
    }

    /// Find the START chunk of the object run containing `address`
    ///
    /// Walks backwards chunk by chunk. Returns `None` if a SCAVENGED chunk is
    /// met first (the run was already claimed) or the region start is passed.
    pub fn find_start(&self, address: usize) -> Option<usize> {
        let mut index = self.chunk_index(address);
        loop {
            match self.state(index) {
                ChunkState::Start => return Some(self.heap_address_from_chunk_index(index)),
                ChunkState::Scavenged => return None,
                ChunkState::Middle | ChunkState::Creating => {
                    if index == 0 {
                        return None;
                    }
                    index -= 1;
                },
            }
        }
    }

    /// End of the object run starting at `start`
    ///
    /// First address of the next non-MIDDLE chunk, or the region end.
    pub fn chunk_end(&self, start: usize) -> usize {
        let mut index = self.chunk_index(start) + 1;
        while index < self.chunk_count() && self.is_middle(index) {
            index += 1;
        }
        self.heap_address_from_chunk_index(index).min(self.region.end())
    }

    /// Claim the first START chunk in a half-open index range
    ///
    /// Returns the chunk's heap address if this caller won its CAS.
    pub fn claim_next(&self, indices: Range<usize>) -> Option<usize> {
        let end = indices.end.min(self.chunk_count());
        (indices.start..end)
            .find(|&index| {
                self.is_start(index) && self.compare_and_swap_start_at(index) == ChunkState::Start
            })
            .map(|index| self.heap_address_from_chunk_index(index))
    }

    /// Count chunks in a given state
    pub fn count(&self, state: ChunkState) -> usize {
        (0..self.chunk_count())
            .filter(|&index| self.state(index) == state)
            .count()
    }

    /// Write one line per chunk: `<index>: <STATE> -- 0x<addr>`
    ///
    /// Diagnostic only; the format is not stable.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for index in 0..self.chunk_count() {
            writeln!(
                out,
                "{}: {} -- {:#x}",
                index,
                self.state(index),
                self.heap_address_from_chunk_index(index)
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkSideTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSideTable")
            .field("region", &self.region)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(size: usize) -> ChunkSideTable {
        ChunkSideTable::try_new(HeapRegion::new(0x10000, size).unwrap()).unwrap()
    }

    fn chunk(table: &ChunkSideTable, index: usize) -> usize {
        table.heap_address_from_chunk_index(index)
    }

    #[test]
    fn test_fresh_table_is_middle() {
        let t = table(2000);
        assert_eq!(t.chunk_count(), 4);
        assert_eq!(t.count(ChunkState::Middle), 4);
    }

    #[test]
    fn test_unconditional_transitions() {
        let t = table(4096);
        t.mark_creating(chunk(&t, 1));
        assert!(t.is_creating(1));
        t.mark_start(chunk(&t, 1) + 100);
        assert!(t.is_start(1));
        t.mark_scavenged(chunk(&t, 1));
        assert!(t.is_scavenged(1));
        t.mark_middle(chunk(&t, 1));
        assert!(t.is_middle(1));
    }

    #[test]
    fn test_cas_only_claims_start() {
        let t = table(4096);
        t.mark_creating(chunk(&t, 0));
        assert_eq!(t.compare_and_swap_start(chunk(&t, 0)), ChunkState::Creating);
        assert!(t.is_creating(0));
        assert_eq!(t.compare_and_swap_start(chunk(&t, 1)), ChunkState::Middle);
        assert!(t.is_middle(1));
    }

    #[test]
    fn test_publish_requires_creating() {
        let t = table(4096);
        assert!(!t.publish(chunk(&t, 2)));
        assert!(t.is_middle(2));
        t.mark_creating(chunk(&t, 2));
        assert!(t.publish(chunk(&t, 2)));
        assert!(t.is_start(2));
    }

    #[test]
    fn test_find_start_walks_back() {
        let t = table(4096);
        t.mark_start(chunk(&t, 2));
        assert_eq!(t.find_start(chunk(&t, 5) + 17), Some(chunk(&t, 2)));
        assert_eq!(t.find_start(chunk(&t, 1)), None);

        t.mark_scavenged(chunk(&t, 4));
        assert_eq!(t.find_start(chunk(&t, 5)), None);
    }

    #[test]
    fn test_chunk_end() {
        let t = table(4096);
        t.mark_start(chunk(&t, 1));
        t.mark_start(chunk(&t, 4));
        assert_eq!(t.chunk_end(chunk(&t, 1)), chunk(&t, 4));
        assert_eq!(t.chunk_end(chunk(&t, 4)), 0x10000 + 4096);
    }

    #[test]
    fn test_chunk_end_clamped_to_unaligned_region() {
        let t = table(2000);
        t.mark_start(chunk(&t, 2));
        assert_eq!(t.chunk_end(chunk(&t, 2)), 0x10000 + 2000);
    }

    #[test]
    fn test_claim_next() {
        let t = table(4096);
        t.mark_start(chunk(&t, 3));
        t.mark_start(chunk(&t, 6));

        assert_eq!(t.claim_next(0..8), Some(chunk(&t, 3)));
        assert_eq!(t.claim_next(0..8), Some(chunk(&t, 6)));
        assert_eq!(t.claim_next(0..8), None);
    }

    #[test]
    fn test_claim_next_range_is_half_open() {
        let t = table(4096);
        t.mark_start(chunk(&t, 4));
        assert_eq!(t.claim_next(0..4), None);
        assert!(t.is_start(4));
    }

    #[test]
    fn test_clear_range() {
        let t = table(4096);
        for i in 0..8 {
            t.mark_start(chunk(&t, i));
        }
        t.clear_range(chunk(&t, 2), chunk(&t, 5));
        assert!(t.is_start(1));
        assert!(t.is_middle(2));
        assert!(t.is_middle(4));
        assert!(t.is_start(5));
    }

    #[test]
    fn test_dump_format() {
        let t = table(1024);
        t.mark_start(chunk(&t, 1));
        let mut out = String::new();
        t.dump(&mut out).unwrap();
        assert_eq!(out, "0: MIDDLE -- 0x10000\n1: START -- 0x10200\n");
    }
}
