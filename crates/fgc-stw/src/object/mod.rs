//! Object Module - Object layout model used by the heap walker
//!
//! The substrate never resolves type metadata itself. An external
//! [`LayoutIntrospector`] maps an object's type descriptor to one of three
//! closed [`ObjectShape`]s, which carry everything needed to size the object
//! and enumerate its reference fields.

pub mod layout;

pub use layout::{
    LayoutIntrospector, ObjectShape, ReferenceOffsets, DEBUG_CELL_TAG, DESCRIPTOR_OFFSET,
};

/// Read one word from the heap
///
/// # Safety
/// `address` must be word aligned and readable.
#[inline]
pub unsafe fn read_word(address: usize) -> usize {
    std::ptr::read_volatile(address as *const usize)
}

/// Write one word to the heap
///
/// # Safety
/// `address` must be word aligned and writable.
#[inline]
pub unsafe fn write_word(address: usize, value: usize) {
    std::ptr::write_volatile(address as *mut usize, value)
}
