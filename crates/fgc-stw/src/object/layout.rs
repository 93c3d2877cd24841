//! Object Layout - Shapes of heap objects
//!
//! ```text
//! Tuple:            ┌────────────┬─────────┬─────────┬─────┐
//!                   │ descriptor │ field 0 │ field 1 │ ... │   size from descriptor
//!                   └────────────┴─────────┴─────────┴─────┘
//!
//! Hybrid:           ┌────────────┬──────────────┬──────────────────────┐
//!                   │ descriptor │ fixed fields │ trailing array (data)│
//!                   └────────────┴──────────────┴──────────────────────┘
//!                   size = fixed_size + length * element_size (word rounded)
//!
//! Reference array:  ┌────────────┬────────┬───────┬───────┬─────┐
//!                   │ descriptor │ length │ ref 0 │ ref 1 │ ... │
//!                   └────────────┴────────┴───────┴───────┴─────┘
//!                   size = header_size + length * WORD_SIZE
//! ```
//!
//! With debug cell tags enabled, every cell is preceded by one
//! [`DEBUG_CELL_TAG`] word and the object origin follows it.

use crate::util::{align_up, constants::WORD_SIZE};

/// Canary word written in front of every cell when debug tagging is on
pub const DEBUG_CELL_TAG: usize = 0xCCCC_CCCC_DEAD_BEEF_u64 as usize;

/// Offset of the type descriptor word from the object origin
pub const DESCRIPTOR_OFFSET: usize = 0;

/// Closed set of object shapes
///
/// Offsets are byte offsets from the object origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectShape<'a> {
    /// Fixed-size object with reference fields at known offsets
    Tuple {
        size: usize,
        reference_offsets: &'a [usize],
    },

    /// Fixed fields followed by a non-reference trailing array
    Hybrid {
        fixed_size: usize,
        reference_offsets: &'a [usize],
        length: usize,
        element_size: usize,
    },

    /// Array whose every element is a reference
    ReferenceArray { header_size: usize, length: usize },
}

impl<'a> ObjectShape<'a> {
    /// Exact size of the object in bytes, header included
    ///
    /// `None` if a (possibly corrupt) length makes the size overflow.
    pub fn size(&self) -> Option<usize> {
        match *self {
            ObjectShape::Tuple { size, .. } => Some(size),
            ObjectShape::Hybrid {
                fixed_size,
                length,
                element_size,
                ..
            } => {
                let unaligned = length
                    .checked_mul(element_size)?
                    .checked_add(fixed_size)?;
                unaligned.checked_add(WORD_SIZE - 1)?;
                Some(align_up(unaligned, WORD_SIZE))
            },
            ObjectShape::ReferenceArray {
                header_size,
                length,
            } => length.checked_mul(WORD_SIZE)?.checked_add(header_size),
        }
    }

    /// Byte offsets of every reference slot
    pub fn reference_offsets(&self) -> ReferenceOffsets<'a> {
        match *self {
            ObjectShape::Tuple {
                reference_offsets, ..
            }
            | ObjectShape::Hybrid {
                reference_offsets, ..
            } => ReferenceOffsets::Fields(reference_offsets.iter()),
            ObjectShape::ReferenceArray {
                header_size,
                length,
            } => ReferenceOffsets::Elements {
                next: header_size,
                end: length.saturating_mul(WORD_SIZE).saturating_add(header_size),
            },
        }
    }

    /// Number of reference slots
    pub fn reference_count(&self) -> usize {
        match *self {
            ObjectShape::Tuple {
                reference_offsets, ..
            }
            | ObjectShape::Hybrid {
                reference_offsets, ..
            } => reference_offsets.len(),
            ObjectShape::ReferenceArray { length, .. } => length,
        }
    }
}

/// Iterator over the reference slot offsets of one object
#[derive(Debug, Clone)]
pub enum ReferenceOffsets<'a> {
    Fields(std::slice::Iter<'a, usize>),
    Elements { next: usize, end: usize },
}

impl Iterator for ReferenceOffsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            ReferenceOffsets::Fields(iter) => iter.next().copied(),
            ReferenceOffsets::Elements { next, end } => {
                if *next < *end {
                    let offset = *next;
                    *next = next.saturating_add(WORD_SIZE);
                    Some(offset)
                } else {
                    None
                }
            },
        }
    }
}

/// Object-layout introspector supplied by the type-metadata subsystem
pub trait LayoutIntrospector {
    /// Shape of the object at `origin` whose header holds `descriptor`
    ///
    /// Returns `None` if `descriptor` is not a valid type descriptor. Array
    /// lengths are read from the object itself.
    fn shape(&self, origin: usize, descriptor: usize) -> Option<ObjectShape<'_>>;
}
