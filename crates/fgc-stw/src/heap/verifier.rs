//! Heap Verifier - Linear cell-by-cell heap walk
//!
//! Walks every cell from a region's start up to its allocation mark and checks
//! that the heap can be parsed: every header holds a known type descriptor and
//! every reference slot is null or accepted by the injected [`GripVerifier`].
//!
//! ```text
//! region start                                           allocation mark
//! │                                                                    │
//! ▼                                                                    ▼
//! ┌─────┬──────────────┬─────┬──────────────┬─────┬───────────┐
//! │ tag │ obj (size a) │ tag │ obj (size b) │ tag │ obj ...   │  (free)
//! └─────┴──────────────┴─────┴──────────────┴─────┴───────────┘
//!   ^ only with debug cell tags
//! ```
//!
//! The walk must run while the world is stopped: it reads objects without
//! any synchronisation.

use super::HeapRegion;
use crate::config::StwConfig;
use crate::error::{HeapIntegrityError, StwError};
use crate::logging::{self, StwEvent};
use crate::object::{self, LayoutIntrospector, DEBUG_CELL_TAG, DESCRIPTOR_OFFSET};
use crate::util::constants::WORD_SIZE;

/// Opaque generation tag forwarded to the grip verifier
///
/// Identifies which heap generation (belt) references are expected to point
/// into during this pass. The walker never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GenerationContext(pub usize);

impl GenerationContext {
    /// Create a context tag
    pub const fn new(tag: usize) -> Self {
        Self(tag)
    }

    /// Raw tag value
    pub const fn tag(&self) -> usize {
        self.0
    }
}

/// Validates that a non-null reference denotes a live object
///
/// Supplied by the surrounding heap implementation. Any
/// `FnMut(GenerationContext, usize) -> bool` closure is a verifier.
pub trait GripVerifier {
    /// Return `true` if `reference` is valid under `context`
    fn verify_grip(&mut self, context: GenerationContext, reference: usize) -> bool;
}

impl<F> GripVerifier for F
where
    F: FnMut(GenerationContext, usize) -> bool,
{
    fn verify_grip(&mut self, context: GenerationContext, reference: usize) -> bool {
        self(context, reference)
    }
}

/// Totals gathered by one successful walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyStats {
    /// Objects walked
    pub objects: usize,

    /// Reference slots inspected, null ones included
    pub references: usize,

    /// Bytes walked, cell tags included
    pub bytes: usize,
}

/// HeapVerifier - walks a region and validates every cell
///
/// # Examples
///
/// ```rust
/// use fgc_stw::heap::{GenerationContext, HeapRegion, HeapVerifier};
/// use fgc_stw::object::{LayoutIntrospector, ObjectShape};
///
/// struct OneWordObjects;
///
/// impl LayoutIntrospector for OneWordObjects {
///     fn shape(&self, _origin: usize, descriptor: usize) -> Option<ObjectShape<'_>> {
///         (descriptor == 0xD0).then_some(ObjectShape::Tuple {
///             size: 8,
///             reference_offsets: &[],
///         })
///     }
/// }
///
/// let heap = vec![0xD0usize; 4];
/// let start = heap.as_ptr() as usize;
/// let region = HeapRegion::new(start, 32)?;
///
/// let verifier = HeapVerifier::new(&OneWordObjects).with_cell_tags(false);
/// let stats = unsafe {
///     verifier.try_verify(region, start + 32, &mut |_: GenerationContext, _: usize| true)
/// }?;
/// assert_eq!(stats.objects, 4);
/// # Ok::<(), fgc_stw::StwError>(())
/// ```
pub struct HeapVerifier<'a, L: LayoutIntrospector + ?Sized> {
    introspector: &'a L,
    cell_tags: bool,
    context: GenerationContext,
}

impl<'a, L: LayoutIntrospector + ?Sized> HeapVerifier<'a, L> {
    /// Create a verifier; cell tags follow the build profile
    pub fn new(introspector: &'a L) -> Self {
        Self {
            introspector,
            cell_tags: cfg!(debug_assertions),
            context: GenerationContext::default(),
        }
    }

    /// Create a verifier honouring `StwConfig::debug_cell_tags`
    pub fn from_config(introspector: &'a L, config: &StwConfig) -> Self {
        Self::new(introspector).with_cell_tags(config.debug_cell_tags)
    }

    /// Enable or disable the debug cell tag check
    pub fn with_cell_tags(mut self, enabled: bool) -> Self {
        self.cell_tags = enabled;
        self
    }

    /// Generation tag passed to the grip verifier
    pub fn with_context(mut self, context: GenerationContext) -> Self {
        self.context = context;
        self
    }

    /// Walk `[region.start(), allocation_mark)`, aborting the process on the
    /// first integrity violation
    ///
    /// # Safety
    /// See [`HeapVerifier::try_verify`].
    pub unsafe fn verify<V: GripVerifier + ?Sized>(
        &self,
        region: HeapRegion,
        allocation_mark: usize,
        grips: &mut V,
    ) -> VerifyStats {
        match self.try_verify(region, allocation_mark, grips) {
            Ok(stats) => stats,
            Err(err) => crate::error::fatal(&StwError::from(err)),
        }
    }

    /// Walk `[region.start(), allocation_mark)` and report the first violation
    ///
    /// # Arguments
    /// * `region` - Region whose allocated prefix is walked
    /// * `allocation_mark` - First unallocated address, at most `region.end()`
    /// * `grips` - Validator for non-null references
    ///
    /// # Returns
    /// Walk totals, or the first [`HeapIntegrityError`] found
    ///
    /// # Safety
    /// Every word in the walked range must be readable, and no mutator may run
    /// during the walk.
    pub unsafe fn try_verify<V: GripVerifier + ?Sized>(
        &self,
        region: HeapRegion,
        allocation_mark: usize,
        grips: &mut V,
    ) -> Result<VerifyStats, HeapIntegrityError> {
        debug_assert!(allocation_mark <= region.end());

        let mut stats = VerifyStats::default();
        let mut cursor = region.start();

        while cursor < allocation_mark {
            let cell = cursor;
            let origin = if self.cell_tags {
                let found = object::read_word(cell);
                if found != DEBUG_CELL_TAG {
                    return Err(HeapIntegrityError::BadCellTag {
                        cell,
                        found,
                        region_start: region.start(),
                    });
                }
                cell + WORD_SIZE
            } else {
                cell
            };

            let descriptor = object::read_word(origin + DESCRIPTOR_OFFSET);
            if descriptor == 0 {
                return Err(HeapIntegrityError::NullDescriptor { cell });
            }

            let shape = self
                .introspector
                .shape(origin, descriptor)
                .ok_or(HeapIntegrityError::InvalidDescriptor { cell, descriptor })?;

            let overrun = |size| HeapIntegrityError::CellOverrun {
                origin,
                size,
                mark: allocation_mark,
            };
            let size = shape.size().ok_or_else(|| overrun(usize::MAX))?;
            if size == 0 {
                return Err(HeapIntegrityError::ZeroSizedCell { origin });
            }
            let end = match origin.checked_add(size) {
                Some(end) if end <= allocation_mark => end,
                _ => return Err(overrun(size)),
            };

            for offset in shape.reference_offsets() {
                let field = origin + offset;
                let reference = object::read_word(field);
                stats.references += 1;
                if reference != 0 && !grips.verify_grip(self.context, reference) {
                    return Err(HeapIntegrityError::InvalidReference {
                        origin,
                        field,
                        reference,
                    });
                }
            }

            stats.objects += 1;
            stats.bytes += end - cell;
            cursor = end;
        }

        log::debug!(
            "Verified {} objects ({} references, {} bytes) in {}",
            stats.objects,
            stats.references,
            stats.bytes,
            region
        );
        logging::log_event(StwEvent::HeapVerified {
            objects: stats.objects,
            references: stats.references,
            bytes: stats.bytes,
        });

        Ok(stats)
    }
}
