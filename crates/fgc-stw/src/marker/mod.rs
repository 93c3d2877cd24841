//! Marker Module - Liveness bookkeeping for the collection procedure
//!
//! The substrate only provides the bitmap. Tracing itself belongs to the
//! injected collection procedure, which receives the bitmap through
//! [`crate::runtime::CollectionScope`].

pub mod bitmap;

pub use bitmap::{MarkBitmap, MarkedAddresses};
