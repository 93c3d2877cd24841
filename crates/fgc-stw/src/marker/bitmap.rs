//! Mark Bitmap - One bit per heap word
//!
//! ```text
//! Region start 0x10000, word size 8, 64 bits per bitmap word
//!
//! object at 0x10208:
//! - word offset: (0x10208 - 0x10000) / 8 = 65
//! - bitmap word: 65 / 64 = 1
//! - bit:         65 % 64 = 1
//! ```
//!
//! Single writer. Marking takes `&mut self`, so sharing a bitmap between
//! marking workers needs an external lock or a partitioned bitmap per worker.

use crate::heap::HeapRegion;
use crate::util::constants::{LOG_WORD_SIZE, WORD_BITS};

/// MarkBitmap - liveness bits for one covered region
#[derive(Clone)]
pub struct MarkBitmap {
    /// Raw bitmap words
    bits: Vec<usize>,

    /// Covered region
    region: HeapRegion,
}

impl MarkBitmap {
    /// Create an all-clear bitmap covering `region`
    pub fn new(region: HeapRegion) -> Self {
        let bit_count = region.size().div_ceil(1 << LOG_WORD_SIZE);
        let word_count = bit_count.div_ceil(WORD_BITS);

        Self {
            bits: vec![0; word_count],
            region,
        }
    }

    /// Covered region
    pub fn covered_region(&self) -> HeapRegion {
        self.region
    }

    /// Set the bit for the word at `address`
    ///
    /// # Arguments
    /// * `address` - Word-aligned covered address
    #[inline]
    pub fn mark(&mut self, address: usize) {
        let (word, bit) = self.calculate_indices(address);
        self.bits[word] |= 1 << bit;
    }

    /// Check if the word at `address` is marked
    #[inline]
    pub fn is_marked(&self, address: usize) -> bool {
        let (word, bit) = self.calculate_indices(address);
        self.bits[word] & (1 << bit) != 0
    }

    /// Clear every bit
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Number of marked words
    pub fn count_marked(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Iterate marked addresses in ascending order
    pub fn marked(&self) -> MarkedAddresses<'_> {
        MarkedAddresses {
            bitmap: self,
            index: 0,
            pending: self.bits.first().copied().unwrap_or(0),
        }
    }

    /// Bitmap size in bytes
    pub fn size_bytes(&self) -> usize {
        self.bits.len() * std::mem::size_of::<usize>()
    }

    fn calculate_indices(&self, address: usize) -> (usize, usize) {
        let bit_index = (address - self.region.start()) >> LOG_WORD_SIZE;
        (bit_index / WORD_BITS, bit_index % WORD_BITS)
    }
}

impl std::fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkBitmap")
            .field("region", &self.region)
            .field("marked", &self.count_marked())
            .finish()
    }
}

/// Iterator over marked addresses, word-at-a-time
pub struct MarkedAddresses<'a> {
    bitmap: &'a MarkBitmap,
    index: usize,
    pending: usize,
}

impl Iterator for MarkedAddresses<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.pending == 0 {
            self.index += 1;
            self.pending = *self.bitmap.bits.get(self.index)?;
        }

        let bit = self.pending.trailing_zeros() as usize;
        self.pending &= self.pending - 1;

        let word_offset = self.index * WORD_BITS + bit;
        Some(self.bitmap.region.start() + (word_offset << LOG_WORD_SIZE))
    }
}
