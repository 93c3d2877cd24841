//! Mutator Registry - The set of attached mutators
//!
//! The registry lock serialises thread attach/detach against collection:
//! the coordinator holds it for a whole cycle, and stopped mutators park by
//! trying to acquire it.

use super::coordinator::{NoopStackMapPreparer, StackMapPreparer};
use super::safepoint::{Mutator, MutatorControlBlock, MutatorState};
use crate::error::{Result, StwError};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier of an attached mutator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(pub u64);

impl fmt::Display for MutatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of an attached thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutatorKind {
    /// Application thread; stopped by every cycle
    Application,

    /// Collector helper thread; never trapped
    GcHelper,
}

pub(crate) type MutatorMap = IndexMap<MutatorId, Arc<MutatorControlBlock>>;

/// MutatorRegistry - live control blocks plus the registry lock
pub struct MutatorRegistry {
    mutators: Mutex<MutatorMap>,
    next_id: AtomicU64,
    preparer: Arc<dyn StackMapPreparer>,
}

impl MutatorRegistry {
    /// Create an empty registry using `preparer` for stack map handoff
    pub fn new(preparer: Arc<dyn StackMapPreparer>) -> Self {
        Self {
            mutators: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            preparer,
        }
    }

    /// Register the calling thread
    ///
    /// Blocks while a collection cycle is in progress.
    pub fn attach(self: &Arc<Self>, kind: MutatorKind) -> Mutator {
        let id = MutatorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let block = Arc::new(MutatorControlBlock::new(id, kind));

        self.mutators.lock().insert(id, Arc::clone(&block));
        log::trace!("Attached mutator {} ({:?})", id, kind);

        Mutator::new(block, Arc::clone(self))
    }

    pub(crate) fn detach(&self, id: MutatorId) {
        if self.mutators.lock().shift_remove(&id).is_some() {
            log::trace!("Detached mutator {}", id);
        }
    }

    /// Acquire the registry lock
    pub(crate) fn lock_mutators(&self) -> MutexGuard<'_, MutatorMap> {
        self.mutators.lock()
    }

    pub(crate) fn preparer(&self) -> &dyn StackMapPreparer {
        self.preparer.as_ref()
    }

    /// Number of attached mutators
    pub fn len(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Check if no mutator is attached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of one mutator
    pub fn state_of(&self, id: MutatorId) -> Result<MutatorState> {
        self.mutators
            .lock()
            .get(&id)
            .map(|block| block.state())
            .ok_or(StwError::MutatorNotRegistered(id.0))
    }

    /// Attach-ordered `(id, state)` pairs
    pub fn snapshot(&self) -> Vec<(MutatorId, MutatorState)> {
        self.mutators
            .lock()
            .values()
            .map(|block| (block.id(), block.state()))
            .collect()
    }

    /// Check if a cycle currently holds the registry lock
    pub fn is_locked(&self) -> bool {
        self.mutators.is_locked()
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NoopStackMapPreparer))
    }
}

impl fmt::Debug for MutatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorRegistry")
            .field("locked", &self.is_locked())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}
