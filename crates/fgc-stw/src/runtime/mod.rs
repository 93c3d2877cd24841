//! Runtime Module - Mutator coordination and the process-scoped context
//!
//! Manages:
//! - Mutator control blocks and the safepoint state machine
//! - The global mutator registry
//! - The stop-the-world coordinator
//!
//! [`GcContext`] ties these together with the heap tables. It is built once
//! at startup and passed to every thread that needs the write barrier or a
//! collection; there are no hidden globals apart from the event logger.

pub mod coordinator;
pub mod registry;
pub mod safepoint;

pub use coordinator::{CycleInfo, NoopStackMapPreparer, StackMapPreparer, StopTheWorldCoordinator};
pub use registry::{MutatorId, MutatorKind, MutatorRegistry};
pub use safepoint::{Mutator, MutatorControlBlock, MutatorState, NativeScope, UnwindContext};

use crate::config::StwConfig;
use crate::error::{Result, StwError};
use crate::heap::{
    CardTable, ChunkSideTable, GripVerifier, HeapRegion, HeapVerifier, ParallelChunkScanner,
    VerifyStats,
};
use crate::marker::MarkBitmap;
use crate::object::LayoutIntrospector;
use crate::stats::{CycleReport, PauseStats};
use parking_lot::Mutex;
use std::sync::Arc;

/// GcContext - everything the collector substrate owns for one heap region
///
/// # Examples
///
/// ```rust
/// use fgc_stw::heap::HeapRegion;
/// use fgc_stw::runtime::{GcContext, MutatorKind};
/// use fgc_stw::StwConfig;
///
/// let context = GcContext::new(HeapRegion::new(0x100000, 64 * 1024)?, StwConfig::default())?;
/// let main = context.attach_mutator(MutatorKind::Application);
///
/// context.write_barrier(0x100000 + 700);
///
/// let (dirty, report) = context.collect_with(Some(&main), |scope| {
///     let dirty = scope.card_table().dirty_count();
///     scope.card_table().clear_all();
///     dirty
/// })?;
/// assert_eq!(dirty, 1);
/// assert_eq!(report.cycle, 1);
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
pub struct GcContext {
    config: StwConfig,
    region: HeapRegion,
    cards: CardTable,
    chunks: ChunkSideTable,
    marks: Mutex<MarkBitmap>,
    scanner: ParallelChunkScanner,
    coordinator: StopTheWorldCoordinator,
}

impl GcContext {
    /// Create a context without precise stack maps
    pub fn new(region: HeapRegion, config: StwConfig) -> Result<Self> {
        Self::with_preparer(region, config, Arc::new(NoopStackMapPreparer))
    }

    /// Create a context that hands unwind contexts to `preparer`
    ///
    /// # Arguments
    /// * `region` - Heap region covered by the card table, side table and bitmap
    /// * `config` - Validated before anything is mapped
    /// * `preparer` - Stack-map handoff hooks
    pub fn with_preparer(
        region: HeapRegion,
        config: StwConfig,
        preparer: Arc<dyn StackMapPreparer>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| StwError::Configuration(e.to_string()))?;

        let cards = CardTable::try_new(region)?;
        let chunks = ChunkSideTable::try_new(region)?;
        let registry = Arc::new(MutatorRegistry::new(preparer));

        log::info!(
            "Collector substrate ready: {} ({} cards, {} scanner workers)",
            region,
            cards.card_count(),
            config.scanner_workers
        );

        Ok(Self {
            region,
            cards,
            chunks,
            marks: Mutex::new(MarkBitmap::new(region)),
            scanner: ParallelChunkScanner::from_config(&config),
            coordinator: StopTheWorldCoordinator::new(registry, config.clone()),
            config,
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &StwConfig {
        &self.config
    }

    /// Covered heap region
    pub fn region(&self) -> HeapRegion {
        self.region
    }

    /// Card table
    pub fn card_table(&self) -> &CardTable {
        &self.cards
    }

    /// Chunk side table
    pub fn side_table(&self) -> &ChunkSideTable {
        &self.chunks
    }

    /// Mutator registry
    pub fn registry(&self) -> &Arc<MutatorRegistry> {
        self.coordinator.registry()
    }

    /// Stop-the-world coordinator
    pub fn coordinator(&self) -> &StopTheWorldCoordinator {
        &self.coordinator
    }

    /// Pause statistics
    pub fn stats(&self) -> &PauseStats {
        self.coordinator.stats()
    }

    /// Register the calling thread
    pub fn attach_mutator(&self, kind: MutatorKind) -> Mutator {
        self.registry().attach(kind)
    }

    /// Reference-store write barrier
    #[inline]
    pub fn write_barrier(&self, field_address: usize) {
        self.cards.mark(field_address);
    }

    /// Run a zero-argument procedure with the world stopped
    pub fn collect<F: FnOnce()>(&self, requester: Option<&Mutator>, procedure: F) -> Result<CycleReport> {
        self.coordinator.collect(requester, procedure)
    }

    /// Run `procedure` with the world stopped and the tables in hand
    pub fn collect_with<F, R>(&self, requester: Option<&Mutator>, procedure: F) -> Result<(R, CycleReport)>
    where
        F: FnOnce(&mut CollectionScope<'_>) -> R,
    {
        self.coordinator.stop_the_world(requester, |info| {
            // Cycles are serialised by the registry lock, so this never waits.
            let mut marks = self.marks.lock();
            let mut scope = CollectionScope {
                info,
                cards: &self.cards,
                chunks: &self.chunks,
                marks: &mut *marks,
                scanner: &self.scanner,
            };
            procedure(&mut scope)
        })
    }

    /// Walk the region up to `allocation_mark`, aborting on corruption
    ///
    /// # Safety
    /// The region must be readable up to `allocation_mark` and the world must
    /// be stopped (call from inside a collection procedure).
    pub unsafe fn verify_heap<L, V>(&self, introspector: &L, allocation_mark: usize, grips: &mut V) -> VerifyStats
    where
        L: LayoutIntrospector + ?Sized,
        V: GripVerifier + ?Sized,
    {
        HeapVerifier::from_config(introspector, &self.config).verify(self.region, allocation_mark, grips)
    }
}

impl std::fmt::Debug for GcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcContext")
            .field("region", &self.region)
            .field("cards", &self.cards)
            .field("chunks", &self.chunks)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// CollectionScope - what the collection procedure works with
pub struct CollectionScope<'a> {
    info: &'a CycleInfo,
    cards: &'a CardTable,
    chunks: &'a ChunkSideTable,
    marks: &'a mut MarkBitmap,
    scanner: &'a ParallelChunkScanner,
}

impl<'a> CollectionScope<'a> {
    /// Current cycle number
    pub fn cycle(&self) -> u64 {
        self.info.cycle
    }

    /// Mutators stopped for this cycle
    pub fn stopped(&self) -> &[MutatorId] {
        &self.info.stopped
    }

    pub fn card_table(&self) -> &'a CardTable {
        self.cards
    }

    pub fn side_table(&self) -> &'a ChunkSideTable {
        self.chunks
    }

    pub fn mark_bitmap(&mut self) -> &mut MarkBitmap {
        self.marks
    }

    pub fn scanner(&self) -> &'a ParallelChunkScanner {
        self.scanner
    }

    /// Reset scan bookkeeping for the next mutation epoch
    ///
    /// Clears every card and restores SCAVENGED chunks to START. Returns the
    /// number of chunks restored.
    pub fn finish_scan_pass(&self) -> usize {
        self.cards.clear_after_scan();
        self.chunks.restore_all()
    }
}
