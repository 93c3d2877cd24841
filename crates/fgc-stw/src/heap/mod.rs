//! Heap Module - Covered regions and their bookkeeping tables
//!
//! Every bookkeeping structure covers exactly one contiguous [`HeapRegion`],
//! sized once at setup and never resized:
//!
//! ```text
//! region:      [start ........................................ start+size)
//! granules:    | 512 B | 512 B | 512 B | 512 B | ...
//! card table:  |  u8   |  u8   |  u8   |  u8   |      DIRTY=0x00 CLEAN=0xFF
//! side table:  | word  | word  | word  | word  |      MIDDLE/START/CREATING/SCAVENGED
//! ```

pub mod card_table;
pub mod scan;
pub mod side_table;
pub mod storage;
pub mod verifier;

pub use card_table::{CardTable, CARD_CLEAN, CARD_DIRTY};
pub use scan::ParallelChunkScanner;
pub use side_table::{ChunkSideTable, ChunkState};
pub use storage::TableStorage;
pub use verifier::{GenerationContext, GripVerifier, HeapVerifier, VerifyStats};

use crate::error::{Result, StwError};
use crate::util::granules_for;

/// HeapRegion - contiguous address range `[start, start + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRegion {
    start: usize,
    size: usize,
}

impl HeapRegion {
    /// Create a region, rejecting empty or wrapping ranges
    pub fn new(start: usize, size: usize) -> Result<Self> {
        if size == 0 || start.checked_add(size).is_none() {
            return Err(StwError::InvalidRegion { start, size });
        }
        Ok(Self { start, size })
    }

    /// First address of the region
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address of the region
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Check if address lies inside the region
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }

    /// Number of 512-byte granules covering the region
    pub fn granule_count(&self) -> usize {
        granules_for(self.size)
    }
}

impl std::fmt::Display for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}
