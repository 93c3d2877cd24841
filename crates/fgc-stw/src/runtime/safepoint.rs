//! Safepoint Protocol - Per-mutator state machine
//!
//! Every attached mutator owns a [`MutatorControlBlock`]. The block's state
//! word is the only thing the collector and the mutator race on; every remote
//! transition is a compare-and-swap.
//!
//! ## Mutator States
//!
//! ```text
//!                  enter_native / leave_native
//!   RUNNING_MANAGED ◄────────────────────────► RUNNING_NATIVE
//!        │                                          │
//!        │ collector requests trap                  │ collector CAS
//!        ▼                                          ▼
//!     STOPPING ──► STOPPED_FROM_MANAGED      STOPPED_FROM_NATIVE
//!      (mutator polls, prepares its map,     (collector completes the
//!       parks on the registry lock)           map from the saved context)
//!        │                                          │
//!        └──── thaw ──► RUNNING_MANAGED             └── thaw ──► RUNNING_NATIVE
//! ```
//!
//! A mutator parks by acquiring the registry lock, which the collector holds
//! for the whole cycle. Thawing happens before that lock is released, so a
//! parked mutator always wakes into a running state.

use super::registry::{MutatorId, MutatorKind, MutatorRegistry};
use crate::error::{Result, StwError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Mutator state word values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutatorState {
    /// Executing managed code; polls for traps
    RunningManaged = 0,

    /// Executing native code; cannot poll
    RunningNative = 1,

    /// Trap requested, mutator has not reached a poll yet
    Stopping = 2,

    /// Parked at a safepoint poll
    StoppedFromManaged = 3,

    /// Frozen by the collector while in native code
    StoppedFromNative = 4,
}

impl MutatorState {
    /// Decode a state word
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MutatorState::RunningManaged),
            1 => Some(MutatorState::RunningNative),
            2 => Some(MutatorState::Stopping),
            3 => Some(MutatorState::StoppedFromManaged),
            4 => Some(MutatorState::StoppedFromNative),
            _ => None,
        }
    }

    /// Quiescent for the purpose of a collection
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            MutatorState::StoppedFromManaged | MutatorState::StoppedFromNative
        )
    }

    /// Stable upper-case name
    pub fn label(&self) -> &'static str {
        match self {
            MutatorState::RunningManaged => "RUNNING_MANAGED",
            MutatorState::RunningNative => "RUNNING_NATIVE",
            MutatorState::Stopping => "STOPPING",
            MutatorState::StoppedFromManaged => "STOPPED_FROM_MANAGED",
            MutatorState::StoppedFromNative => "STOPPED_FROM_NATIVE",
        }
    }
}

impl fmt::Display for MutatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Last known instruction, stack and frame pointers of a thread
///
/// Captured by one thread and copied to whoever prepares its stack map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindContext {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
}

impl UnwindContext {
    /// Capture the calling thread's registers
    #[cfg(target_arch = "x86_64")]
    #[inline(never)]
    pub fn capture() -> Self {
        let (ip, sp, fp): (usize, usize, usize);
        unsafe {
            std::arch::asm!(
                "lea {ip}, [rip]",
                "mov {sp}, rsp",
                "mov {fp}, rbp",
                ip = out(reg) ip,
                sp = out(reg) sp,
                fp = out(reg) fp,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self { ip, sp, fp }
    }

    /// Capture the calling thread's registers
    #[cfg(target_arch = "aarch64")]
    #[inline(never)]
    pub fn capture() -> Self {
        let (ip, sp, fp): (usize, usize, usize);
        unsafe {
            std::arch::asm!(
                "adr {ip}, .",
                "mov {sp}, sp",
                "mov {fp}, x29",
                ip = out(reg) ip,
                sp = out(reg) sp,
                fp = out(reg) fp,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self { ip, sp, fp }
    }

    /// Capture the calling thread's registers (unsupported architecture)
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn capture() -> Self {
        Self::default()
    }

    /// True if nothing was captured
    pub fn is_empty(&self) -> bool {
        self.ip == 0 && self.sp == 0 && self.fp == 0
    }
}

/// MutatorControlBlock - shared state of one attached mutator
///
/// # Thread Safety
///
/// The owning thread performs its own transitions; the collector touches the
/// block only while holding the registry lock. Both sides use atomics for
/// every field they share.
pub struct MutatorControlBlock {
    id: MutatorId,
    kind: MutatorKind,
    thread_name: Option<String>,
    thread: ThreadId,
    state: AtomicU8,
    trap_requested: AtomicBool,
    context: [AtomicUsize; 3],
}

impl MutatorControlBlock {
    pub(crate) fn new(id: MutatorId, kind: MutatorKind) -> Self {
        Self {
            id,
            kind,
            thread_name: std::thread::current().name().map(str::to_owned),
            thread: std::thread::current().id(),
            state: AtomicU8::new(MutatorState::RunningManaged as u8),
            trap_requested: AtomicBool::new(false),
            context: Default::default(),
        }
    }

    /// Registry identifier
    pub fn id(&self) -> MutatorId {
        self.id
    }

    /// Application mutator or collector helper
    pub fn kind(&self) -> MutatorKind {
        self.kind
    }

    /// Name of the thread that attached, if it had one
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Thread that attached
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> MutatorState {
        // Only valid discriminants are ever stored.
        MutatorState::from_u8(self.state.load(Ordering::SeqCst))
            .unwrap_or(MutatorState::RunningManaged)
    }

    /// Check if the collector wants this mutator to stop
    #[inline]
    pub fn trap_requested(&self) -> bool {
        self.trap_requested.load(Ordering::SeqCst)
    }

    /// Last context saved by the mutator
    pub fn context(&self) -> UnwindContext {
        UnwindContext {
            ip: self.context[0].load(Ordering::Acquire),
            sp: self.context[1].load(Ordering::Acquire),
            fp: self.context[2].load(Ordering::Acquire),
        }
    }

    pub(crate) fn save_context(&self, context: UnwindContext) {
        self.context[0].store(context.ip, Ordering::Release);
        self.context[1].store(context.sp, Ordering::Release);
        self.context[2].store(context.fp, Ordering::Release);
    }

    /// CAS the state word, returning whether this caller won
    pub(crate) fn transition(&self, from: MutatorState, to: MutatorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Collector: raise the trap flag and move a managed mutator to STOPPING
    ///
    /// Returns the state observed after the attempt.
    pub(crate) fn request_trap(&self) -> MutatorState {
        self.trap_requested.store(true, Ordering::SeqCst);
        self.transition(MutatorState::RunningManaged, MutatorState::Stopping);
        self.state()
    }

    /// Collector: freeze a mutator running native code
    pub(crate) fn try_stop_native(&self) -> bool {
        self.transition(MutatorState::RunningNative, MutatorState::StoppedFromNative)
    }

    /// Collector: clear the trap and resume a stopped mutator
    ///
    /// Returns the state the mutator was stopped in.
    pub(crate) fn thaw(&self) -> MutatorState {
        self.trap_requested.store(false, Ordering::SeqCst);
        let stopped = self.state();
        let resumed = match stopped {
            MutatorState::StoppedFromNative => MutatorState::RunningNative,
            _ => MutatorState::RunningManaged,
        };
        self.state.store(resumed as u8, Ordering::SeqCst);
        stopped
    }
}

impl fmt::Debug for MutatorControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorControlBlock")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("trap_requested", &self.trap_requested())
            .finish()
    }
}

/// Mutator - the attached thread's handle
///
/// Obtained from [`MutatorRegistry::attach`]; detaches on drop. All methods
/// must be called from the thread that owns the handle.
///
/// # Examples
///
/// ```rust
/// use fgc_stw::runtime::{MutatorKind, MutatorRegistry, MutatorState};
/// use std::sync::Arc;
///
/// let registry = Arc::new(MutatorRegistry::default());
/// let mutator = registry.attach(MutatorKind::Application);
///
/// mutator.poll();
/// {
///     let _native = mutator.native()?;
///     assert_eq!(mutator.state(), MutatorState::RunningNative);
/// }
/// assert_eq!(mutator.state(), MutatorState::RunningManaged);
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
pub struct Mutator {
    block: Arc<MutatorControlBlock>,
    registry: Arc<MutatorRegistry>,
}

impl Mutator {
    pub(crate) fn new(block: Arc<MutatorControlBlock>, registry: Arc<MutatorRegistry>) -> Self {
        Self { block, registry }
    }

    /// Registry identifier
    pub fn id(&self) -> MutatorId {
        self.block.id()
    }

    /// Application mutator or collector helper
    pub fn kind(&self) -> MutatorKind {
        self.block.kind()
    }

    /// Current state
    pub fn state(&self) -> MutatorState {
        self.block.state()
    }

    /// Shared control block
    pub fn control_block(&self) -> &Arc<MutatorControlBlock> {
        &self.block
    }

    pub(crate) fn registry(&self) -> &Arc<MutatorRegistry> {
        &self.registry
    }

    /// Safepoint poll
    ///
    /// Fast path is a single load. Blocks for the rest of the cycle if the
    /// collector requested a trap.
    #[inline]
    pub fn poll(&self) {
        if self.block.trap_requested() {
            self.block_at_safepoint();
        }
    }

    /// Switch to native mode
    ///
    /// Saves the unwind context first so the collector can complete this
    /// thread's stack map if it freezes the thread while native.
    pub fn enter_native(&self) -> Result<()> {
        self.block.save_context(UnwindContext::capture());

        loop {
            match self.block.state() {
                MutatorState::RunningManaged => {
                    if self
                        .block
                        .transition(MutatorState::RunningManaged, MutatorState::RunningNative)
                    {
                        return Ok(());
                    }
                },
                MutatorState::Stopping => self.block_at_safepoint(),
                other => return Err(self.invalid_state("RUNNING_MANAGED", other)),
            }
        }
    }

    /// Return to managed mode
    ///
    /// Waits for the current cycle to end if the collector froze this thread
    /// while it was native.
    pub fn leave_native(&self) -> Result<()> {
        loop {
            match self.block.state() {
                MutatorState::RunningNative => {
                    if self
                        .block
                        .transition(MutatorState::RunningNative, MutatorState::RunningManaged)
                    {
                        self.poll();
                        return Ok(());
                    }
                },
                MutatorState::StoppedFromNative => {
                    log::trace!("Mutator {} waiting for cycle before leaving native", self.id());
                    drop(self.registry.lock_mutators());
                },
                other => return Err(self.invalid_state("RUNNING_NATIVE", other)),
            }
        }
    }

    /// Enter native mode for the lifetime of the returned guard
    pub fn native(&self) -> Result<NativeScope<'_>> {
        self.enter_native()?;
        Ok(NativeScope { mutator: self })
    }

    /// Slow path: prepare the partial stack map, report STOPPED_FROM_MANAGED,
    /// and park until the collector releases the registry lock
    #[cold]
    fn block_at_safepoint(&self) {
        let context = UnwindContext::capture();
        self.block.save_context(context);
        self.registry
            .preparer()
            .prepare_partial(self.id(), &context);

        loop {
            let current = self.block.state();
            match current {
                MutatorState::RunningManaged | MutatorState::Stopping => {
                    if self
                        .block
                        .transition(current, MutatorState::StoppedFromManaged)
                    {
                        break;
                    }
                },
                _ => break,
            }
        }

        log::trace!("Mutator {} parked at safepoint", self.id());
        drop(self.registry.lock_mutators());
        log::trace!("Mutator {} resumed as {}", self.id(), self.block.state());
    }

    fn invalid_state(&self, expected: &str, actual: MutatorState) -> StwError {
        StwError::InvalidState {
            expected: expected.to_string(),
            actual: actual.label().to_string(),
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        // A cycle must not wait on a thread that is blocked detaching. A
        // pending trap is honoured first; native or stopped threads already
        // count as quiescent.
        if matches!(
            self.block.state(),
            MutatorState::RunningManaged | MutatorState::Stopping
        ) {
            if let Err(err) = self.enter_native() {
                log::warn!("Mutator {} detaching in unexpected state: {}", self.id(), err);
            }
        }
        self.registry.detach(self.id());
    }
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mutator").field(&self.block).finish()
    }
}

/// NativeScope - RAII guard for a native-code region
///
/// Leaves native mode on drop.
#[must_use = "native mode ends as soon as the scope is dropped"]
pub struct NativeScope<'a> {
    mutator: &'a Mutator,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutator.leave_native() {
            log::warn!("Mutator {} failed to leave native: {}", self.mutator.id(), err);
        }
    }
}
