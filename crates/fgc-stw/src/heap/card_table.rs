//! Card Table - Write barrier log over a covered region
//!
//! One byte per 512-byte card. A barriered reference store dirties the card
//! containing the written field; a scan pass visits only dirty cards and then
//! clears them.
//!
//! ```text
//! Region start 0x1000, 4096 bytes -> 8 cards
//!
//! store to 0x1258 -> index = (0x1258 - 0x1000) >> 9 = 1
//!
//! cards: FF 00 FF FF FF FF FF FF
//!           ^ dirty
//! ```

use super::storage::TableStorage;
use super::HeapRegion;
use crate::error::Result;
use crate::logging::{self, StwEvent};
use crate::util::constants::{GRANULE_SHIFT, GRANULE_SIZE};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

/// Card written since the last scan
pub const CARD_DIRTY: u8 = 0x00;

/// Card not written since the last scan
pub const CARD_CLEAN: u8 = 0xFF;

/// log2 of the card size
pub const CARD_SHIFT: u32 = GRANULE_SHIFT;

/// Bytes covered by one card
pub const CARD_SIZE: usize = GRANULE_SIZE;

/// CardTable - byte-per-card write barrier log
///
/// # Thread Safety
///
/// `mark` may be called by any number of mutators concurrently; each store is
/// a single relaxed byte write. Clearing happens while the world is stopped.
///
/// # Examples
///
/// ```rust
/// use fgc_stw::heap::{CardTable, HeapRegion};
///
/// let region = HeapRegion::new(0x1000, 4096)?;
/// let cards = CardTable::try_new(region)?;
///
/// cards.mark(0x1000 + 600);
/// assert!(cards.is_dirty(1));
/// assert!(!cards.is_dirty(0));
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
pub struct CardTable {
    /// Region whose stores this table logs
    region: HeapRegion,

    /// One byte per card
    storage: TableStorage,
}

impl CardTable {
    /// Create a card table, aborting the process if storage cannot be mapped
    pub fn new(region: HeapRegion) -> Self {
        crate::or_fatal!(Self::try_new(region))
    }

    /// Create a card table over anonymous mapped storage
    ///
    /// All cards start CLEAN.
    pub fn try_new(region: HeapRegion) -> Result<Self> {
        let storage = TableStorage::anonymous("card table", region.granule_count())?;
        Ok(Self::initialize(region, storage))
    }

    /// Create a card table in caller-provided storage
    ///
    /// # Safety
    /// `storage` must be valid for `region.granule_count()` bytes, outlive the
    /// table, and not be accessed by anything else while the table exists.
    pub unsafe fn with_storage(region: HeapRegion, storage: *mut u8) -> Self {
        let storage = TableStorage::external(storage, region.granule_count());
        Self::initialize(region, storage)
    }

    fn initialize(region: HeapRegion, storage: TableStorage) -> Self {
        let table = Self { region, storage };
        table.clear_all();
        log::debug!(
            "Card table covering {} with {} cards at {:#x}",
            region,
            table.card_count(),
            table.storage.base()
        );
        table
    }

    #[inline]
    fn cards(&self) -> &[AtomicU8] {
        self.storage.bytes()
    }

    /// Number of card slots
    #[inline]
    pub fn card_count(&self) -> usize {
        self.storage.len()
    }

    /// Region covered by this table
    pub fn covered_region(&self) -> HeapRegion {
        self.region
    }

    /// Address of the table storage
    pub fn storage_address(&self) -> usize {
        self.storage.base()
    }

    /// Card index for a covered address
    ///
    /// No range check: callers guarantee the address is covered.
    #[inline]
    pub fn card_index(&self, address: usize) -> usize {
        address.wrapping_sub(self.region.start()) >> CARD_SHIFT
    }

    /// First heap address of a card
    #[inline]
    pub fn heap_address_from_card_index(&self, index: usize) -> usize {
        self.region.start() + (index << CARD_SHIFT)
    }

    /// Dirty the card containing `address`
    ///
    /// Write barrier fast path.
    #[inline]
    pub fn mark(&self, address: usize) {
        self.cards()[self.card_index(address)].store(CARD_DIRTY, Ordering::Relaxed);
    }

    /// Dirty every card overlapping `[start, end)`
    pub fn mark_range(&self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let first = self.card_index(start);
        let last = self.card_index(end - 1);
        for card in &self.cards()[first..=last] {
            card.store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Check if a card is dirty
    #[inline]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.cards()[index].load(Ordering::Relaxed) == CARD_DIRTY
    }

    /// Reset every card to CLEAN
    pub fn clear_all(&self) {
        self.clear_cards(0..self.card_count());
    }

    /// Reset the cards for heap addresses `[start, end)` to CLEAN
    ///
    /// The range is half-open in card indices: the card containing `end` is
    /// left untouched unless `end` is at or past the end of the region.
    pub fn clear_range(&self, start: usize, end: usize) {
        let first = self.card_index(start);
        let last = if end >= self.region.end() {
            self.card_count()
        } else {
            self.card_index(end)
        };
        if first < last {
            self.clear_cards(first..last);
        }
    }

    /// Reset a half-open range of card indices to CLEAN
    pub fn clear_cards(&self, indices: Range<usize>) {
        let count = indices.len();
        let first = indices.start;
        for card in &self.cards()[indices] {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
        log::trace!("Cleared {} cards from index {}", count, first);
    }

    /// Clear all cards and record the pass in the global event log
    pub fn clear_after_scan(&self) {
        self.clear_all();
        logging::log_event(StwEvent::CardsCleared {
            first: 0,
            count: self.card_count(),
        });
    }

    /// Iterate the dirty card indices within a half-open index range
    pub fn dirty_cards(&self, indices: Range<usize>) -> impl Iterator<Item = usize> + '_ {
        let end = indices.end.min(self.card_count());
        (indices.start..end).filter(move |&index| self.is_dirty(index))
    }

    /// Count dirty cards in the whole table
    pub fn dirty_count(&self) -> usize {
        self.dirty_cards(0..self.card_count()).count()
    }

    /// Write one line per card: `0 -- 0x<addr>` if dirty, `1 -- 0x<addr>` if clean
    ///
    /// Diagnostic only; the format is not stable.
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for index in 0..self.card_count() {
            let flag = if self.is_dirty(index) { '0' } else { '1' };
            writeln!(
                out,
                "{} -- {:#x}",
                flag,
                self.heap_address_from_card_index(index)
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for CardTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardTable")
            .field("region", &self.region)
            .field("cards", &self.card_count())
            .field("dirty", &self.dirty_count())
            .finish()
    }
}
