//! # FGC-STW - Stop-the-World Coordination Substrate
//!
//! The part of a stop-the-world collector that everything else stands on: the
//! handshake that parks every mutator at a point where the heap graph can be
//! traversed, and the per-region bookkeeping the collection algorithm uses to
//! find work.
//!
//! ## Overview
//!
//! - **Card Table**: one byte per 512-byte card, dirtied by the write barrier
//! - **Chunk Side Table**: one word per 512-byte chunk locating object starts;
//!   scanners claim chunks with a START→SCAVENGED compare-and-swap
//! - **Mark Bitmap**: one bit per heap word, single writer
//! - **Heap Verifier**: linear walk checking headers and references
//! - **Safepoint Protocol**: per-mutator state machine with trap requests
//! - **Stop-the-World Coordinator**: lock ordering, quiescence, thaw
//!
//! ## Quick Start
//!
//! ```rust
//! use fgc_stw::heap::HeapRegion;
//! use fgc_stw::runtime::{GcContext, MutatorKind};
//! use fgc_stw::StwConfig;
//!
//! fn main() -> Result<(), fgc_stw::StwError> {
//!     let context = GcContext::new(HeapRegion::new(0x4000_0000, 1 << 20)?, StwConfig::default())?;
//!     let main = context.attach_mutator(MutatorKind::Application);
//!
//!     // Barriered store into the heap
//!     context.write_barrier(0x4000_0000 + 4096);
//!
//!     // Managed code polls regularly
//!     main.poll();
//!
//!     let report = context.collect(Some(&main), || {
//!         // every other application mutator is parked here
//!     })?;
//!     println!("pause: {:?}", report.pause);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Mutator Threads                       │
//! │   poll() / enter_native() / leave_native()  write barrier │
//! └──────────────┬─────────────────────────────────┬─────────┘
//!                │ trap flag + state word           │ mark(addr)
//!                ▼                                  ▼
//! ┌──────────────────────────────┐   ┌───────────────────────┐
//! │ StopTheWorldCoordinator      │   │ CardTable             │
//! │ 1 lock special refs          │   │ ChunkSideTable        │
//! │ 1 lock registry              │   │ MarkBitmap            │
//! │ 2 request traps  3 fence     │   └───────────┬───────────┘
//! │ 4 await quiescence           │               │
//! │ 5 collector map + procedure ─┼──► CollectionScope
//! │ 6 thaw  7 unlock (reverse)   │
//! └──────────────────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Storage mapping failures and heap corruption are unrecoverable. The
//! `try_*` constructors and [`heap::HeapVerifier::try_verify`] return
//! [`StwError`]; their plain counterparts report through [`error::fatal`] and
//! hard-exit the process with [`error::HARD_EXIT_CODE`].
//!
//! ## Module Organization
//!
//! - [`heap`] - Regions, card table, side table, scanning, verifier
//! - [`marker`] - Mark bitmap
//! - [`object`] - Object shapes and the layout introspector seam
//! - [`runtime`] - Safepoints, registry, coordinator, [`runtime::GcContext`]
//! - [`stats`] - Pause statistics
//! - [`config`] - Configuration
//! - [`error`] - Error types and fatal exit
//! - [`logging`] - Structured cycle events

pub mod config;
pub mod error;
pub mod heap;
pub mod logging;
pub mod marker;
pub mod object;
pub mod runtime;
pub mod stats;
pub mod util;

pub use config::StwConfig;
pub use error::{HeapIntegrityError, Result, StwError};
pub use heap::{CardTable, ChunkSideTable, ChunkState, HeapRegion, HeapVerifier};
pub use marker::MarkBitmap;
pub use runtime::{
    CollectionScope, GcContext, Mutator, MutatorKind, MutatorState, StackMapPreparer,
    StopTheWorldCoordinator,
};
pub use stats::{CycleReport, PauseStats};
