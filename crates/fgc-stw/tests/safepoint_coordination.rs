//! Safepoint Coordination Tests - Stopping and resuming real threads
//!
//! These tests verify:
//! - Managed mutators park at polls and resume after the cycle
//! - Native mutators are frozen by CAS and keep running native code
//! - Quiescence holds for every target whenever the procedure runs
//! - Thread attach and native exit block for the duration of a cycle
//! - Concurrent requesters never deadlock
//!
//! ============================================================================
//! EVERY TEST USES REAL OS THREADS - TIMEOUTS MEAN A HANDSHAKE BUG
//! ============================================================================

mod common;

use common::{wait_until, ContextFixture, TEST_TIMEOUT};
use fgc_stw::heap::HeapRegion;
use fgc_stw::runtime::{MutatorControlBlock, MutatorId, StackMapPreparer, UnwindContext};
use fgc_stw::{GcContext, MutatorKind, MutatorState, StwConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handles of a group of spinning mutator threads
struct Spinners {
    blocks: Arc<Mutex<Vec<Arc<MutatorControlBlock>>>>,
    stop: Arc<AtomicBool>,
    progress: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl Spinners {
    /// Start `count` managed threads that increment `progress` and poll
    fn managed(ctx: &Arc<GcContext>, count: usize) -> Self {
        Self::start(ctx, count, false)
    }

    /// Start `count` threads alternating between managed polls and native spans
    fn toggling(ctx: &Arc<GcContext>, count: usize) -> Self {
        Self::start(ctx, count, true)
    }

    fn start(ctx: &Arc<GcContext>, count: usize, toggle_native: bool) -> Self {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let ready = Arc::new(Barrier::new(count + 1));

        let handles = (0..count)
            .map(|_| {
                let ctx = Arc::clone(ctx);
                let blocks = Arc::clone(&blocks);
                let stop = Arc::clone(&stop);
                let progress = Arc::clone(&progress);
                let ready = Arc::clone(&ready);
                thread::spawn(move || {
                    let mutator = ctx.attach_mutator(MutatorKind::Application);
                    blocks.lock().unwrap().push(Arc::clone(mutator.control_block()));
                    ready.wait();

                    while !stop.load(Ordering::Relaxed) {
                        progress.fetch_add(1, Ordering::SeqCst);
                        mutator.poll();
                        if toggle_native {
                            let _native = mutator.native().expect("enter native from managed");
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        ready.wait();
        Self {
            blocks,
            stop,
            progress,
            handles,
        }
    }

    fn blocks(&self) -> Vec<Arc<MutatorControlBlock>> {
        self.blocks.lock().unwrap().clone()
    }

    fn progress(&self) -> usize {
        self.progress.load(Ordering::SeqCst)
    }

    fn finish(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            handle.join().expect("mutator thread should not panic");
        }
    }
}

/// ============================================================================
/// MANAGED MUTATORS
/// ============================================================================

/// Four managed spinners; the procedure runs once with the counter frozen
///
/// **Bug this finds:** Mutators running managed code during collection
/// **Invariant verified:** All targets STOPPED_FROM_MANAGED, then resume
#[test]
fn test_four_managed_spinners_freeze_and_resume() {
    let fixture = ContextFixture::with_defaults();
    let spinners = Spinners::managed(&fixture.ctx, 4);
    assert!(wait_until(TEST_TIMEOUT, || spinners.progress() > 1000));

    let runs = AtomicUsize::new(0);
    let report = fixture
        .ctx
        .collect(None, || {
            runs.fetch_add(1, Ordering::SeqCst);
            for block in spinners.blocks() {
                assert_eq!(block.state(), MutatorState::StoppedFromManaged);
            }
            let frozen = spinners.progress();
            thread::sleep(Duration::from_millis(30));
            assert_eq!(spinners.progress(), frozen, "counter moved during collection");
        })
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(report.targets, 4);
    assert_eq!(report.stopped_from_managed, 4);
    assert_eq!(report.stopped_from_native, 0);

    let after = spinners.progress();
    assert!(wait_until(TEST_TIMEOUT, || spinners.progress() > after + 1000));
    for block in spinners.blocks() {
        assert!(!block.trap_requested());
        assert!(!block.state().is_stopped());
    }

    spinners.finish();
    assert!(fixture.ctx.registry().is_empty());
}

/// ============================================================================
/// NATIVE MUTATORS
/// ============================================================================

/// A thread sitting in native code is frozen without its cooperation
///
/// **Bug this finds:** Collector waiting forever on a thread that cannot poll
/// **Invariant verified:** Thaw restores RUNNING_NATIVE
#[test]
fn test_native_mutator_frozen_by_collector() {
    let fixture = ContextFixture::with_defaults();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(AtomicBool::new(false));
    let native_work = Arc::new(AtomicUsize::new(0));

    let worker = {
        let ctx = Arc::clone(&fixture.ctx);
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        let native_work = Arc::clone(&native_work);
        thread::spawn(move || {
            let mutator = ctx.attach_mutator(MutatorKind::Application);
            let native = mutator.native().unwrap();
            entered.wait();
            while !release.load(Ordering::SeqCst) {
                native_work.fetch_add(1, Ordering::Relaxed);
                std::hint::spin_loop();
            }
            drop(native);
            mutator.state()
        })
    };

    entered.wait();
    let report = fixture
        .ctx
        .collect(None, || {
            // Native code keeps running while frozen
            let before = native_work.load(Ordering::Relaxed);
            assert!(wait_until(TEST_TIMEOUT, || native_work.load(Ordering::Relaxed) > before));
        })
        .unwrap();

    assert_eq!(report.stopped_from_native, 1);
    release.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), MutatorState::RunningManaged);
}

/// Leaving native mode during a cycle waits for the cycle to end
///
/// **Bug this finds:** A frozen thread slipping back into managed code
#[test]
fn test_leave_native_blocks_until_thaw() {
    let fixture = ContextFixture::with_defaults();
    let entered = Arc::new(Barrier::new(2));
    let try_leave = Arc::new(AtomicBool::new(false));
    let left = Arc::new(AtomicBool::new(false));

    let worker = {
        let ctx = Arc::clone(&fixture.ctx);
        let entered = Arc::clone(&entered);
        let try_leave = Arc::clone(&try_leave);
        let left = Arc::clone(&left);
        thread::spawn(move || {
            let mutator = ctx.attach_mutator(MutatorKind::Application);
            mutator.enter_native().unwrap();
            entered.wait();
            while !try_leave.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            mutator.leave_native().unwrap();
            left.store(true, Ordering::SeqCst);
        })
    };

    entered.wait();
    fixture
        .ctx
        .collect(None, || {
            try_leave.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            assert!(!left.load(Ordering::SeqCst), "left native during collection");
        })
        .unwrap();

    assert!(wait_until(TEST_TIMEOUT, || left.load(Ordering::SeqCst)));
    worker.join().expect("worker should not panic");
}

/// ============================================================================
/// QUIESCENCE PROPERTY
/// ============================================================================

/// Every target is stopped whenever the procedure runs, across many cycles
///
/// **Bug this finds:** Races between native transitions and trap requests
#[test]
fn test_quiescence_with_mixed_mutators() {
    let fixture = ContextFixture::with_defaults();
    let managed = Spinners::managed(&fixture.ctx, 3);
    let toggling = Spinners::toggling(&fixture.ctx, 3);
    let mut targets = managed.blocks();
    targets.extend(toggling.blocks());

    for cycle in 1..=20u64 {
        let (stopped, report) = fixture
            .ctx
            .collect_with(None, |scope| {
                for block in &targets {
                    assert!(
                        block.state().is_stopped(),
                        "mutator {} is {} during cycle {}",
                        block.id(),
                        block.state(),
                        scope.cycle()
                    );
                }
                scope.stopped().len()
            })
            .unwrap();

        assert_eq!(report.cycle, cycle);
        assert_eq!(stopped, 6);
        assert_eq!(report.stopped_from_managed + report.stopped_from_native, 6);
    }

    assert_eq!(fixture.ctx.stats().cycles(), 20);
    managed.finish();
    toggling.finish();
}

/// ============================================================================
/// REGISTRY INTERACTION
/// ============================================================================

/// A thread attaching mid-cycle waits for the cycle to finish
///
/// **Bug this finds:** New mutators escaping the stopped world
#[test]
fn test_attach_blocked_during_cycle() {
    let fixture = ContextFixture::with_defaults();
    let attached = Arc::new(AtomicBool::new(false));
    let mut late = None;

    fixture
        .ctx
        .collect(None, || {
            let ctx = Arc::clone(&fixture.ctx);
            let attached_flag = Arc::clone(&attached);
            late = Some(thread::spawn(move || {
                let mutator = ctx.attach_mutator(MutatorKind::Application);
                attached_flag.store(true, Ordering::SeqCst);
                mutator.poll();
            }));
            thread::sleep(Duration::from_millis(50));
            assert!(!attached.load(Ordering::SeqCst), "attached during collection");
        })
        .unwrap();

    late.expect("thread spawned")
        .join()
        .expect("late thread should not panic");
    assert!(attached.load(Ordering::SeqCst));
}

/// Collector helper threads are never trapped
///
/// **Bug this finds:** Cycle waiting on a helper that never polls
#[test]
fn test_helper_not_stopped() {
    let fixture = ContextFixture::with_defaults();
    let stop = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Barrier::new(2));

    let helper = {
        let ctx = Arc::clone(&fixture.ctx);
        let stop = Arc::clone(&stop);
        let started = Arc::clone(&started);
        thread::spawn(move || {
            let mutator = ctx.attach_mutator(MutatorKind::GcHelper);
            started.wait();
            while !stop.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            mutator.state()
        })
    };

    started.wait();
    let report = fixture.ctx.collect(None, || {}).unwrap();
    assert_eq!(report.targets, 0);

    stop.store(true, Ordering::SeqCst);
    assert_eq!(helper.join().unwrap(), MutatorState::RunningManaged);
}

/// A thread exits while its trap is pending; the cycle still completes
///
/// **Bug this finds:** Detach blocking on the registry lock before the
/// exiting thread reports stopped, stalling the collector forever
#[test]
fn test_exit_with_pending_trap() {
    let fixture = ContextFixture::with_defaults();
    let attached = Arc::new(Barrier::new(2));

    let exiting = {
        let ctx = Arc::clone(&fixture.ctx);
        let attached = Arc::clone(&attached);
        thread::spawn(move || {
            let mutator = ctx.attach_mutator(MutatorKind::Application);
            attached.wait();
            // Never polls; exits as soon as the trap lands
            while mutator.state() != MutatorState::Stopping {
                std::hint::spin_loop();
            }
            drop(mutator);
        })
    };
    attached.wait();
    assert_eq!(fixture.ctx.registry().len(), 1);

    let (done_tx, done_rx) = mpsc::channel();
    let collector = {
        let ctx = Arc::clone(&fixture.ctx);
        thread::spawn(move || {
            let report = ctx.collect(None, || {}).unwrap();
            let _ = done_tx.send(report);
        })
    };

    let report = done_rx
        .recv_timeout(TEST_TIMEOUT)
        .expect("cycle stalled on an exiting mutator");
    assert_eq!(report.targets, 1);
    assert_eq!(report.stopped_from_managed, 1);

    collector.join().expect("collector should not panic");
    exiting.join().expect("exiting thread should not panic");
    assert!(fixture.ctx.registry().is_empty());
}

/// A thread frozen in native code exits; detaching waits for the thaw
///
/// **Bug this finds:** A registry entry vanishing in the middle of a cycle
#[test]
fn test_exit_while_frozen_in_native() {
    let fixture = ContextFixture::with_defaults();
    let entered = Arc::new(Barrier::new(2));
    let exit = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));

    let worker = {
        let ctx = Arc::clone(&fixture.ctx);
        let entered = Arc::clone(&entered);
        let exit = Arc::clone(&exit);
        let exited = Arc::clone(&exited);
        thread::spawn(move || {
            let mutator = ctx.attach_mutator(MutatorKind::Application);
            mutator.enter_native().unwrap();
            entered.wait();
            while !exit.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            drop(mutator);
            exited.store(true, Ordering::SeqCst);
        })
    };

    entered.wait();
    let report = fixture
        .ctx
        .collect(None, || {
            exit.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            assert!(!exited.load(Ordering::SeqCst), "detached during collection");
        })
        .unwrap();

    assert_eq!(report.stopped_from_native, 1);
    worker.join().expect("worker should not panic");
    assert!(exited.load(Ordering::SeqCst));
    assert!(fixture.ctx.registry().is_empty());
}

/// Several mutators request collections at the same time
///
/// **Bug this finds:** Deadlock between a requester waiting for the locks and
/// a cycle waiting for that requester
#[test]
fn test_concurrent_requesters_do_not_deadlock() {
    let fixture = ContextFixture::with_defaults();
    let threads = 4;
    let cycles_each = 5;
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ctx = Arc::clone(&fixture.ctx);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let me = ctx.attach_mutator(MutatorKind::Application);
                start.wait();
                for _ in 0..cycles_each {
                    me.poll();
                    let report = ctx
                        .collect(Some(&me), || {
                            assert_eq!(me.state(), MutatorState::RunningManaged);
                        })
                        .unwrap();
                    assert!(report.targets <= threads - 1);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("requester should not panic");
    }
    assert_eq!(fixture.ctx.stats().cycles(), (threads * cycles_each) as u64);
}

/// ============================================================================
/// STACK MAP HANDOFF
/// ============================================================================

#[derive(Default)]
struct RecordingPreparer {
    partial: Mutex<Vec<MutatorId>>,
    completed: Mutex<Vec<(MutatorId, UnwindContext)>>,
    collector: AtomicUsize,
}

impl StackMapPreparer for RecordingPreparer {
    fn prepare_partial(&self, mutator: MutatorId, _: &UnwindContext) {
        self.partial.lock().unwrap().push(mutator);
    }

    fn complete(&self, mutator: MutatorId, context: &UnwindContext) {
        self.completed.lock().unwrap().push((mutator, *context));
    }

    fn prepare_collector(&self, _: &UnwindContext) {
        self.collector.fetch_add(1, Ordering::SeqCst);
    }
}

/// Managed targets prepare their own maps; native targets are completed
/// by the collector from the context saved on entering native
///
/// **Bug this finds:** Handoff reading a live context instead of the saved copy
#[test]
fn test_stack_map_handoff() {
    let preparer = Arc::new(RecordingPreparer::default());
    let ctx = Arc::new(
        GcContext::with_preparer(
            HeapRegion::new(common::FAKE_HEAP_BASE, 64 * 1024).unwrap(),
            StwConfig::default(),
            preparer.clone(),
        )
        .unwrap(),
    );

    let managed = Spinners::managed(&ctx, 1);
    let managed_id = managed.blocks()[0].id();

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(AtomicBool::new(false));
    let native = {
        let ctx = Arc::clone(&ctx);
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            let mutator = ctx.attach_mutator(MutatorKind::Application);
            mutator.enter_native().unwrap();
            let saved = mutator.control_block().context();
            entered.wait();
            while !release.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            mutator.leave_native().unwrap();
            (mutator.id(), saved)
        })
    };
    entered.wait();

    ctx.collect(None, || {}).unwrap();
    release.store(true, Ordering::SeqCst);
    let (native_id, saved) = native.join().unwrap();
    managed.finish();

    assert_eq!(preparer.collector.load(Ordering::SeqCst), 1);
    assert_eq!(*preparer.partial.lock().unwrap(), vec![managed_id]);
    assert_eq!(*preparer.completed.lock().unwrap(), vec![(native_id, saved)]);
}
