//! Test Utilities for the STW Substrate Test Suite
//!
//! Fixtures shared by the integration tests:
//! - `ContextFixture`: a `GcContext` over a fake address range
//! - `SimHeap`: a word-array heap with a tiny object model, for the verifier
//! - `wait_until`: bounded polling for cross-thread assertions

#![allow(dead_code)]

use fgc_stw::heap::HeapRegion;
use fgc_stw::object::{self, LayoutIntrospector, ObjectShape, DEBUG_CELL_TAG};
use fgc_stw::util::constants::WORD_SIZE;
use fgc_stw::{GcContext, StwConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum time a test waits on another thread
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Base of the fake address range used for table-only tests
pub const FAKE_HEAP_BASE: usize = 0x1000_0000;

/// ============================================================================
/// CONTEXT FIXTURE
/// ============================================================================

/// Test fixture wrapping a shared `GcContext`
pub struct ContextFixture {
    pub ctx: Arc<GcContext>,
}

impl ContextFixture {
    /// 1MB fake region, small quiescence sleep
    ///
    /// **Bug this finds:** Context construction or config validation failures
    pub fn with_defaults() -> Self {
        Self::with_config(StwConfig {
            quiescence_sleep_us: 20,
            scanner_workers: 4,
            ..Default::default()
        })
    }

    pub fn with_config(config: StwConfig) -> Self {
        let region = HeapRegion::new(FAKE_HEAP_BASE, 1024 * 1024).unwrap();
        let ctx = GcContext::new(region, config).expect("context should build with valid config");
        Self { ctx: Arc::new(ctx) }
    }
}

/// ============================================================================
/// SIMULATED HEAP
/// ============================================================================

pub const NODE: usize = 0x1111_0000;
pub const BYTES: usize = 0x2222_0000;
pub const REFS: usize = 0x3333_0000;

static NODE_REFS: [usize; 2] = [WORD_SIZE, 2 * WORD_SIZE];

/// Object model of `SimHeap`
///
/// - NODE: descriptor, two reference fields (3 words)
/// - BYTES: descriptor, length, `length` bytes of data (hybrid)
/// - REFS: descriptor, length, `length` references
pub struct SimLayouts;

impl LayoutIntrospector for SimLayouts {
    fn shape(&self, origin: usize, descriptor: usize) -> Option<ObjectShape<'_>> {
        let length = || unsafe { object::read_word(origin + WORD_SIZE) };
        match descriptor {
            NODE => Some(ObjectShape::Tuple {
                size: 3 * WORD_SIZE,
                reference_offsets: &NODE_REFS,
            }),
            BYTES => Some(ObjectShape::Hybrid {
                fixed_size: 2 * WORD_SIZE,
                reference_offsets: &[],
                length: length(),
                element_size: 1,
            }),
            REFS => Some(ObjectShape::ReferenceArray {
                header_size: 2 * WORD_SIZE,
                length: length(),
            }),
            _ => None,
        }
    }
}

/// Bump-allocated heap backed by a boxed word slice
pub struct SimHeap {
    words: Box<[usize]>,
    top: usize,
    tags: bool,
    origins: Vec<usize>,
}

impl SimHeap {
    pub fn new(capacity_words: usize, tags: bool) -> Self {
        Self {
            words: vec![0; capacity_words].into_boxed_slice(),
            top: 0,
            tags,
            origins: Vec::new(),
        }
    }

    pub fn start(&self) -> usize {
        self.words.as_ptr() as usize
    }

    pub fn region(&self) -> HeapRegion {
        HeapRegion::new(self.start(), self.words.len() * WORD_SIZE).unwrap()
    }

    /// First unallocated address
    pub fn mark(&self) -> usize {
        self.start() + self.top * WORD_SIZE
    }

    /// Origins of every allocated object, in allocation order
    pub fn origins(&self) -> &[usize] {
        &self.origins
    }

    fn allocate(&mut self, payload: &[usize], total_words: usize) -> usize {
        if self.tags {
            self.words[self.top] = DEBUG_CELL_TAG;
            self.top += 1;
        }
        let index = self.top;
        self.words[index..index + payload.len()].copy_from_slice(payload);
        self.top += total_words;
        let origin = self.start() + index * WORD_SIZE;
        self.origins.push(origin);
        origin
    }

    pub fn alloc_node(&mut self, left: usize, right: usize) -> usize {
        self.allocate(&[NODE, left, right], 3)
    }

    pub fn alloc_bytes(&mut self, length: usize) -> usize {
        let total = (2 * WORD_SIZE + length).div_ceil(WORD_SIZE);
        self.allocate(&[BYTES, length], total)
    }

    pub fn alloc_refs(&mut self, elements: &[usize]) -> usize {
        let mut payload = vec![REFS, elements.len()];
        payload.extend_from_slice(elements);
        let total = payload.len();
        self.allocate(&payload, total)
    }

    /// Overwrite one word at an absolute address
    pub fn poke(&mut self, address: usize, value: usize) {
        let index = (address - self.start()) / WORD_SIZE;
        self.words[index] = value;
    }

    /// Check if `address` is the origin of an allocated object
    pub fn is_origin(&self, address: usize) -> bool {
        self.origins.binary_search(&address).is_ok()
    }
}

/// ============================================================================
/// ASSERTIONS & POLLING
/// ============================================================================

/// Assert that no value appears twice
pub fn assert_all_unique(values: &[usize]) {
    let unique: HashSet<_> = values.iter().collect();
    assert_eq!(
        unique.len(),
        values.len(),
        "duplicate values: {} of {} unique",
        unique.len(),
        values.len()
    );
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
