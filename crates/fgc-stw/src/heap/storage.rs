//! Table Storage - Backing memory for card and side tables
//!
//! Tables are sized once at setup and never grow. Storage is either an
//! anonymous `memmap2` mapping owned by the table, or caller-provided memory
//! at a fixed address (e.g. reserved next to the boot heap).
//!
//! Slots are exposed as atomic views so that mutators, scanner workers and the
//! collector can touch them through `&self`. `AtomicU8` and `AtomicUsize` have
//! the same in-memory representation as `u8` and `usize`.

use crate::error::{Result, StwError};
use crate::util::{align_up, constants::WORD_SIZE};
use memmap2::{MmapMut, MmapOptions};
use std::sync::atomic::{AtomicU8, AtomicUsize};

enum Backing {
    /// Anonymous mapping owned by this storage; unmapped on drop
    Mapped(#[allow(dead_code)] MmapMut),
    /// Memory owned by the caller
    External,
}

/// TableStorage - fixed-size backing memory for a bookkeeping table
pub struct TableStorage {
    backing: Backing,
    base: usize,
    len: usize,
    mapped_size: usize,
}

// SAFETY: all access after construction goes through atomic views.
unsafe impl Send for TableStorage {}
unsafe impl Sync for TableStorage {}

impl TableStorage {
    /// Map `len` bytes of zeroed anonymous memory
    ///
    /// The mapping is rounded up to the system page size.
    ///
    /// # Arguments
    /// * `table` - Table name used in the error report
    /// * `len` - Number of bytes the table needs
    pub fn anonymous(table: &'static str, len: usize) -> Result<Self> {
        let mapped_size = align_up(len.max(1), page_size::get());

        let mut mmap = MmapOptions::new()
            .len(mapped_size)
            .map_anon()
            .map_err(|e| StwError::TableMapping {
                table,
                bytes: mapped_size,
                reason: e.to_string(),
            })?;

        let base = mmap.as_mut_ptr() as usize;

        log::debug!(
            "Mapped {} bytes of {} storage at {:#x}",
            mapped_size,
            table,
            base
        );

        Ok(Self {
            backing: Backing::Mapped(mmap),
            base,
            len,
            mapped_size,
        })
    }

    /// Use caller-provided memory as table storage
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `len` bytes, word aligned,
    /// and must outlive the returned storage. No other code may access the
    /// memory non-atomically while the storage exists.
    pub unsafe fn external(base: *mut u8, len: usize) -> Self {
        Self {
            backing: Backing::External,
            base: base as usize,
            len,
            mapped_size: len,
        }
    }

    /// Base address of the storage
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of usable bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if storage holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size actually reserved (page rounded for mappings)
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Check if this storage owns its mapping
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// View the storage as atomic bytes
    pub fn bytes(&self) -> &[AtomicU8] {
        // SAFETY: base is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.base as *const AtomicU8, self.len) }
    }

    /// View the storage as atomic words
    ///
    /// Trailing bytes that do not fill a whole word are not included.
    pub fn words(&self) -> &[AtomicUsize] {
        debug_assert_eq!(self.base % WORD_SIZE, 0, "table storage must be word aligned");
        // SAFETY: base is word aligned and valid for len bytes.
        unsafe {
            std::slice::from_raw_parts(self.base as *const AtomicUsize, self.len / WORD_SIZE)
        }
    }
}
