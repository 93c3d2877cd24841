//! Stop-the-World Coordinator - Drives one collection cycle
//!
//! Cycle protocol, in strict order:
//! 1. Acquire the special-reference lock, then the registry lock.
//! 2. Request a trap on every application mutator except the requester.
//! 3. Store-load fence, so the trap flags are visible before states are read.
//! 4. Await quiescence: each target reports STOPPED_FROM_MANAGED, or the
//!    collector CASes a native target to STOPPED_FROM_NATIVE and completes
//!    its stack map from the saved unwind context.
//! 5. Prepare the collector's own stack map, then run the procedure.
//! 6. Clear every trap and restore running states.
//! 7. Release the locks in reverse order.
//!
//! There is no timeout. A mutator that never polls stalls the cycle; the
//! coordinator only warns about it.

use super::registry::{MutatorId, MutatorKind, MutatorRegistry};
use super::safepoint::{Mutator, MutatorControlBlock, MutatorState, UnwindContext};
use crate::config::StwConfig;
use crate::error::{Result, StwError};
use crate::logging::{self, StwEvent};
use crate::stats::{CycleReport, PauseStats};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stack reference-map handoff hooks
///
/// Implemented by the stack-walking subsystem. Every hook defaults to doing
/// nothing.
pub trait StackMapPreparer: Send + Sync {
    /// Mutator side, just before parking at a safepoint
    fn prepare_partial(&self, _mutator: MutatorId, _context: &UnwindContext) {}

    /// Collector side, for a mutator frozen in native code
    fn complete(&self, _mutator: MutatorId, _context: &UnwindContext) {}

    /// Collector side, for its own stack, immediately before the procedure
    fn prepare_collector(&self, _context: &UnwindContext) {}
}

/// Preparer for runtimes without precise stack maps
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStackMapPreparer;

impl StackMapPreparer for NoopStackMapPreparer {}

/// What the collection procedure knows about the stopped world
#[derive(Debug, Clone)]
pub struct CycleInfo {
    /// Cycle number, starting at 1
    pub cycle: u64,

    /// Mutators stopped for this cycle, in attach order
    pub stopped: Vec<MutatorId>,
}

/// StopTheWorldCoordinator - owns the cycle protocol
///
/// # Examples
///
/// ```rust
/// use fgc_stw::runtime::{MutatorKind, MutatorRegistry, StopTheWorldCoordinator};
/// use fgc_stw::StwConfig;
/// use std::sync::Arc;
///
/// let registry = Arc::new(MutatorRegistry::default());
/// let coordinator = StopTheWorldCoordinator::new(Arc::clone(&registry), StwConfig::default());
///
/// let main = registry.attach(MutatorKind::Application);
/// let report = coordinator.collect(Some(&main), || {
///     // mark, copy, compact ...
/// })?;
/// assert_eq!(report.cycle, 1);
/// assert_eq!(report.targets, 0);
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
pub struct StopTheWorldCoordinator {
    registry: Arc<MutatorRegistry>,
    special_reference_lock: Mutex<()>,
    config: StwConfig,
    stats: PauseStats,
    cycles: AtomicU64,
}

impl StopTheWorldCoordinator {
    /// Create a coordinator over `registry`
    pub fn new(registry: Arc<MutatorRegistry>, config: StwConfig) -> Self {
        Self {
            registry,
            special_reference_lock: Mutex::new(()),
            config,
            stats: PauseStats::new(),
            cycles: AtomicU64::new(0),
        }
    }

    /// Registry this coordinator stops
    pub fn registry(&self) -> &Arc<MutatorRegistry> {
        &self.registry
    }

    /// Running pause totals
    pub fn stats(&self) -> &PauseStats {
        &self.stats
    }

    /// Lock shared with the special-reference manager
    ///
    /// Always taken before the registry lock.
    pub fn special_reference_lock(&self) -> &Mutex<()> {
        &self.special_reference_lock
    }

    /// Run a zero-argument collection procedure with the world stopped
    pub fn collect<F>(&self, requester: Option<&Mutator>, procedure: F) -> Result<CycleReport>
    where
        F: FnOnce(),
    {
        self.stop_the_world(requester, |_| procedure())
            .map(|((), report)| report)
    }

    /// Run `procedure` with every application mutator stopped
    ///
    /// # Arguments
    /// * `requester` - Mutator handle of the calling thread, if it is attached.
    ///   It is not stopped, and waits in native mode while the locks are taken
    ///   so a concurrent cycle is not blocked on it. An attached thread in
    ///   managed code must pass its handle; `None` from such a thread is
    ///   rejected with [`StwError::RequesterNotSupplied`].
    /// * `procedure` - The collection algorithm
    ///
    /// # Returns
    /// The procedure's result and the cycle report
    pub fn stop_the_world<F, R>(
        &self,
        requester: Option<&Mutator>,
        procedure: F,
    ) -> Result<(R, CycleReport)>
    where
        F: FnOnce(&CycleInfo) -> R,
    {
        if let Some(mutator) = requester {
            if !Arc::ptr_eq(mutator.registry(), &self.registry) {
                return Err(StwError::MutatorNotRegistered(mutator.id().0));
            }
        }

        // 1. Locks, special reference manager first
        let native = requester.map(Mutator::native).transpose()?;
        let special_guard = self.special_reference_lock.lock();
        let mutators = self.registry.lock_mutators();
        drop(native);

        let requester_id = requester.map(Mutator::id);
        if requester_id.is_none() {
            // A caller in managed code would be its own target.
            let caller = std::thread::current().id();
            if let Some(block) = mutators.values().find(|block| {
                block.thread_id() == caller
                    && block.kind() == MutatorKind::Application
                    && !matches!(block.state(), MutatorState::RunningNative)
            }) {
                return Err(StwError::RequesterNotSupplied(block.id().0));
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let targets: Vec<Arc<MutatorControlBlock>> = mutators
            .values()
            .filter(|block| {
                block.kind() == MutatorKind::Application && Some(block.id()) != requester_id
            })
            .cloned()
            .collect();

        let pause_start = Instant::now();
        self.emit(StwEvent::CycleStart {
            cycle,
            targets: targets.len(),
        });

        // 2. Trap requests
        for block in &targets {
            let observed = block.request_trap();
            log::trace!("Cycle {}: trap requested on {} ({})", cycle, block.id(), observed);
        }
        self.emit(StwEvent::TrapsRequested {
            cycle,
            requested: targets.len(),
        });

        // 3. Trap flags before state reads
        fence(Ordering::SeqCst);

        // 4. Quiescence
        let thaw = ThawOnDrop {
            cycle,
            targets: &targets,
        };
        let mut report = CycleReport {
            cycle,
            targets: targets.len(),
            ..Default::default()
        };
        for block in &targets {
            match self.await_stopped(cycle, block) {
                MutatorState::StoppedFromNative => report.stopped_from_native += 1,
                _ => report.stopped_from_managed += 1,
            }
        }
        report.quiescence = pause_start.elapsed();
        self.emit(StwEvent::QuiescenceReached {
            cycle,
            waited_us: report.quiescence.as_micros() as u64,
        });

        // 5. Collector stack map, then the procedure
        let info = CycleInfo {
            cycle,
            stopped: targets.iter().map(|block| block.id()).collect(),
        };
        let collection_start = Instant::now();
        self.registry
            .preparer()
            .prepare_collector(&UnwindContext::capture());
        let result = procedure(&info);
        report.collection = collection_start.elapsed();
        self.emit(StwEvent::CollectionComplete {
            cycle,
            duration_us: report.collection.as_micros() as u64,
        });

        // 6. Thaw, 7. unlock in reverse order
        drop(thaw);
        report.pause = pause_start.elapsed();
        drop(mutators);
        drop(special_guard);

        self.stats.record(&report);
        self.emit(StwEvent::CycleEnd {
            cycle,
            pause_us: report.pause.as_micros() as u64,
        });
        log::debug!(
            "Cycle {} stopped {} mutators ({} native), pause {:?}",
            cycle,
            report.targets,
            report.stopped_from_native,
            report.pause
        );

        Ok((result, report))
    }

    /// Block until `block` is stopped; returns the stopped state
    fn await_stopped(&self, cycle: u64, block: &MutatorControlBlock) -> MutatorState {
        let backoff = Backoff::new();
        let started = Instant::now();
        let warn_after = Duration::from_millis(self.config.slow_quiescence_warn_ms);
        let sleep = Duration::from_micros(self.config.quiescence_sleep_us);
        let mut spins = 0;
        let mut warned = false;

        loop {
            match block.state() {
                state @ MutatorState::StoppedFromManaged => {
                    self.stopped(cycle, block, false);
                    return state;
                },
                MutatorState::StoppedFromNative => {
                    self.stopped(cycle, block, true);
                    return MutatorState::StoppedFromNative;
                },
                MutatorState::RunningNative => {
                    if block.try_stop_native() {
                        self.registry
                            .preparer()
                            .complete(block.id(), &block.context());
                        continue;
                    }
                },
                MutatorState::RunningManaged | MutatorState::Stopping => {},
            }

            if spins < self.config.quiescence_spin_limit {
                backoff.snooze();
                spins += 1;
            } else {
                std::thread::sleep(sleep);
            }

            if !warned && started.elapsed() >= warn_after {
                warned = true;
                let waited_ms = started.elapsed().as_millis() as u64;
                log::warn!(
                    "Cycle {}: mutator {} not stopped after {}ms ({})",
                    cycle,
                    block.id(),
                    waited_ms,
                    block.state()
                );
                self.emit(StwEvent::SlowQuiescence {
                    cycle,
                    mutator: block.id().0,
                    waited_ms,
                });
            }
        }
    }

    fn stopped(&self, cycle: u64, block: &MutatorControlBlock, from_native: bool) {
        log::trace!(
            "Cycle {}: mutator {} stopped ({})",
            cycle,
            block.id(),
            if from_native { "native" } else { "managed" }
        );
        self.emit(StwEvent::MutatorStopped {
            cycle,
            mutator: block.id().0,
            from_native,
        });
    }

    fn emit(&self, event: StwEvent) {
        if self.config.verbose {
            logging::log_event(event);
        }
    }
}

impl std::fmt::Debug for StopTheWorldCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopTheWorldCoordinator")
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .field("registry", &self.registry)
            .finish()
    }
}

/// Thaws every target when dropped, including on unwind out of the procedure
struct ThawOnDrop<'a> {
    cycle: u64,
    targets: &'a [Arc<MutatorControlBlock>],
}

impl Drop for ThawOnDrop<'_> {
    fn drop(&mut self) {
        for block in self.targets {
            let stopped = block.thaw();
            log::trace!("Cycle {}: thawed {} from {}", self.cycle, block.id(), stopped);
        }
    }
}
