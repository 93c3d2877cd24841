//! Error Module - Collector Substrate Error Types
//!
//! Two kinds of failure exist in this crate:
//!
//! ## Recoverable (returned as `StwError`)
//! - `TableMapping` - backing storage for a card/side table could not be mapped
//! - `InvalidRegion` - covered region is empty or overflows the address space
//! - `Configuration` - invalid `StwConfig`
//! - `HeapIntegrity` - the verifier found a corrupted cell or reference
//! - `MutatorNotRegistered` - a handle refers to a mutator that already exited
//! - `InvalidState` - a mutator state transition was attempted from the wrong state
//!
//! ## Fatal (process termination)
//! Card tables, side tables and the heap verifier never degrade gracefully.
//! The non-`try` entry points route any of the errors above through
//! [`fatal`], which writes a diagnostic and hard-exits with [`HARD_EXIT_CODE`].

use thiserror::Error;

/// Exit code used when the collector substrate detects unrecoverable corruption
pub const HARD_EXIT_CODE: i32 = 11;

/// Main error type for all substrate operations
///
/// # Examples
///
/// ```rust
/// use fgc_stw::error::StwError;
///
/// fn describe(err: &StwError) -> &'static str {
///     match err {
///         StwError::TableMapping { .. } => "mapping",
///         StwError::HeapIntegrity(_) => "heap",
///         _ => "other",
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum StwError {
    /// Backing storage for a bookkeeping table could not be mapped
    ///
    /// **When returned:** `try_new` on a card or side table
    ///
    /// **Recovery strategy:** None in production; `new` aborts the process
    #[error("Failed to map {bytes} bytes of {table} storage: {reason}")]
    TableMapping {
        table: &'static str,
        bytes: usize,
        reason: String,
    },

    /// Covered region is empty or wraps around the address space
    #[error("Invalid heap region [{start:#x}, +{size:#x})")]
    InvalidRegion { start: usize, size: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Heap verification found a violated invariant
    ///
    /// **Recovery strategy:** Cannot recover - the heap is corrupt
    #[error("Heap integrity violation: {0}")]
    HeapIntegrity(#[from] HeapIntegrityError),

    /// The mutator handle no longer has a registry entry
    #[error("Mutator {0} is not registered")]
    MutatorNotRegistered(u64),

    /// An attached thread requested a cycle without passing its own handle
    ///
    /// **Example scenario:** `collect(None, ..)` from a mutator thread, which
    /// would otherwise wait on itself forever
    #[error("Mutator {0} requested a cycle without its handle")]
    RequesterNotSupplied(u64),

    /// Invalid mutator state transition
    ///
    /// **Example scenario:** `leave_native` on a thread that is in managed code
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl StwError {
    /// Check if this error means collector invariants are broken
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StwError::TableMapping { .. } | StwError::HeapIntegrity(_)
        )
    }
}

/// Findings of the heap walker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapIntegrityError {
    /// Cell header holds a null type descriptor
    #[error("Null type descriptor in cell at {cell:#x}")]
    NullDescriptor { cell: usize },

    /// Header points at something the layout introspector does not recognise
    #[error("Invalid type descriptor {descriptor:#x} in cell at {cell:#x}")]
    InvalidDescriptor { cell: usize, descriptor: usize },

    /// Debug canary word preceding the cell was overwritten
    #[error("Bad debug cell tag {found:#x} at {cell:#x} (region start {region_start:#x})")]
    BadCellTag {
        cell: usize,
        found: usize,
        region_start: usize,
    },

    /// Reference field fails the injected grip verifier
    #[error("Invalid reference {reference:#x} at {field:#x} in object {origin:#x}")]
    InvalidReference {
        origin: usize,
        field: usize,
        reference: usize,
    },

    /// Object extends past the allocation mark
    #[error("Object at {origin:#x} of {size} bytes overruns allocation mark {mark:#x}")]
    CellOverrun {
        origin: usize,
        size: usize,
        mark: usize,
    },

    /// Object reports zero size; the walk would never terminate
    #[error("Zero-sized object at {origin:#x}")]
    ZeroSizedCell { origin: usize },
}

/// Result type alias for substrate operations
pub type Result<T> = std::result::Result<T, StwError>;

/// Report an unrecoverable collector error and terminate the process
///
/// Writes the diagnostic to the `log` sink and to stderr, then exits without
/// unwinding or running destructors.
#[cold]
pub fn fatal(err: &StwError) -> ! {
    log::error!("FATAL collector error: {}", err);
    eprintln!("[GC] FATAL: {}", err);
    hard_exit(HARD_EXIT_CODE)
}

#[cfg(unix)]
fn hard_exit(code: i32) -> ! {
    // SAFETY: _exit never returns and touches no Rust state.
    unsafe { libc::_exit(code) }
}

#[cfg(not(unix))]
fn hard_exit(code: i32) -> ! {
    std::process::exit(code)
}

/// Unwrap a substrate result or abort the process
#[macro_export]
macro_rules! or_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => $crate::error::fatal(&err),
        }
    };
}
