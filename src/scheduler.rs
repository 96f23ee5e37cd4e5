//! Scheduler interface, and a simple reference executor.
//!
//! The dependency core does not run tasks itself: it hands runnable tasks
//! to the [`Schedule`] implementation stored in each task, and trusts that
//! implementation to execute them fairly. The [`Scheduler`] type in this
//! module is a minimal executor for exactly that interface — useful on its
//! own for simple workloads, and as a reference for embedding the core in
//! a real worker pool.

use crate::loom::sync::{
    atomic::{AtomicUsize, Ordering::*},
    Arc,
};
use crate::task::{Header, TaskHandle, TaskRef};

use cordyceps::mpsc_queue::MpscQueue;
use core::fmt;

/// A scheduler's interface to the dependency core.
///
/// Every task stores a (cheaply clonable) handle to its scheduler, and the
/// graph passes the task back to that handle when the task becomes
/// runnable. The two reservation hooks let a scheduler — or a task group
/// built on top of one — keep a count of the tasks attached to it for
/// join purposes; their default implementations do nothing.
pub trait Schedule: Clone {
    /// Enqueues `task` for execution.
    ///
    /// This transfers ownership of the task to the scheduler: the task must
    /// eventually be [run](TaskRef::run), or it (and everything still
    /// ordered after it) is leaked.
    fn schedule(&self, task: TaskRef);

    /// Called when a new task is bound to this scheduler, before the task
    /// becomes reachable from anywhere else.
    fn reserve(&self) {}

    /// Called when a task bound to this scheduler is destroyed — after it
    /// ran to completion, or when its [`TaskHandle`] was dropped without
    /// being submitted.
    fn release(&self) {}
}

/// A simple run-queue executor for `hypha` tasks.
///
/// Tasks may be created from (and submitted on) any thread; work is
/// performed by whichever threads call [`tick`](Scheduler::tick). Only one
/// thread may tick at a time — the run queue is multi-producer,
/// single-consumer — but a second ticking thread simply waits its turn, so
/// ticking from several threads is safe.
#[derive(Clone)]
pub struct Scheduler(Arc<Core>);

struct Core {
    run_queue: MpscQueue<Header>,

    /// The number of live tasks bound to this scheduler: deferred, waiting
    /// on predecessors, queued, or running.
    tasks: AtomicUsize,
}

/// Statistics recorded during a single call to [`Scheduler::tick`].
#[derive(Debug)]
#[non_exhaustive]
pub struct Tick {
    /// The number of tasks that ran to completion during this tick.
    pub completed: usize,

    /// Of those, the number executed directly by the completing worker
    /// (work bypass) rather than going through the run queue.
    pub bypassed: usize,

    /// Whether the run queue still had tasks in it when this tick's budget
    /// ran out.
    pub has_remaining: bool,
}

// === impl Scheduler ===

impl Scheduler {
    /// How many tasks are run per call to [`Scheduler::tick`].
    ///
    /// Chosen by fair dice roll, guaranteed to be random.
    pub const DEFAULT_TICK_SIZE: usize = 256;

    /// Returns a new scheduler with an empty run queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task bound to this scheduler without submitting it,
    /// returning its [`TaskHandle`].
    ///
    /// The deferred task can be wired into the dependency graph through the
    /// handle, and runs only once the handle is
    /// [submitted](TaskHandle::submit) *and* all of its predecessors have
    /// completed.
    pub fn defer<F>(&self, body: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        TaskHandle::new(self.0.clone(), body)
    }

    /// Creates a task and submits it immediately.
    #[inline]
    pub fn spawn<F>(&self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.defer(body).submit()
    }

    /// Runs up to [`Self::DEFAULT_TICK_SIZE`] tasks from the run queue on
    /// the calling thread, returning a [`Tick`] describing the work
    /// performed.
    ///
    /// A completing task may hand one ready successor straight back to this
    /// worker; such bypassed tasks are executed immediately and counted
    /// against the budget, but never touch the queue.
    ///
    /// Task bodies must not call `tick` on their own scheduler: the run
    /// queue is single-consumer, and a nested tick would wait forever for
    /// the outer one to finish. Creating and submitting new tasks from a
    /// body is fine.
    pub fn tick(&self) -> Tick {
        self.0.tick_n(Self::DEFAULT_TICK_SIZE)
    }

    /// Returns `true` if no tasks are currently bound to this scheduler.
    ///
    /// Deferred tasks whose handles are still live, tasks waiting on
    /// predecessors, queued tasks, and running tasks all count as bound, so
    /// this is the "everything joined" condition a task group waits for.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.0.tasks.load(Acquire) == 0
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self(Arc::new(Core::new()))
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.0.tasks)
            .finish()
    }
}

// === impl Core ===

impl Core {
    fn new() -> Self {
        let stub = TaskRef::new(Stub, || ());
        Self {
            run_queue: MpscQueue::new_with_stub(stub),
            tasks: AtomicUsize::new(0),
        }
    }

    fn tick_n(&self, n: usize) -> Tick {
        let mut tick = Tick {
            completed: 0,
            bypassed: 0,
            has_remaining: true,
        };

        for task in self.run_queue.consume() {
            test_trace!(task = ?task, "tick: running");
            let mut next = task.run();
            tick.completed += 1;

            // The task's completion may hand us one ready successor; run it
            // here instead of taking it back through the queue.
            while let Some(task) = next {
                test_trace!(task = ?task, "tick: running (bypass)");
                next = task.run();
                tick.completed += 1;
                tick.bypassed += 1;
            }

            if tick.completed >= n {
                test_debug!(?tick, "tick: budget spent");
                return tick;
            }
        }

        // We drained the current run queue.
        tick.has_remaining = false;
        test_debug!(?tick, "tick: drained");
        tick
    }
}

impl Schedule for Arc<Core> {
    fn schedule(&self, task: TaskRef) {
        self.run_queue.enqueue(task);
    }

    fn reserve(&self) {
        self.tasks.fetch_add(1, Relaxed);
    }

    fn release(&self) {
        let tasks = self.tasks.fetch_sub(1, Release);
        debug_assert!(tasks > 0, "released a task that was never reserved");
    }
}

/// Scheduler for the run queue's stub task, which is never actually
/// scheduled or run.
#[derive(Copy, Clone, Debug)]
struct Stub;

impl Schedule for Stub {
    fn schedule(&self, _: TaskRef) {
        unreachable!("the stub task should never be scheduled!")
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn basically_works() {
        let _trace = crate::util::test::trace_init();
        let scheduler = Scheduler::new();
        let it_worked = Arc::new(AtomicBool::new(false));

        scheduler.spawn({
            let it_worked = it_worked.clone();
            move || it_worked.store(true, Ordering::Release)
        });

        assert!(!scheduler.is_idle());

        let tick = scheduler.tick();

        assert!(it_worked.load(Ordering::Acquire));
        assert_eq!(tick.completed, 1);
        assert_eq!(tick.bypassed, 0);
        assert!(!tick.has_remaining);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn schedule_many() {
        const TASKS: usize = 10;

        let _trace = crate::util::test::trace_init();
        let scheduler = Scheduler::new();
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..TASKS {
            scheduler.spawn({
                let completed = completed.clone();
                move || {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let tick = scheduler.tick();

        assert_eq!(tick.completed, TASKS);
        assert_eq!(completed.load(Ordering::SeqCst), TASKS);
        assert!(!tick.has_remaining);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn tick_budget() {
        const TASKS: usize = Scheduler::DEFAULT_TICK_SIZE + 44;

        let _trace = crate::util::test::trace_init();
        let scheduler = Scheduler::new();

        for _ in 0..TASKS {
            scheduler.spawn(|| ());
        }

        let tick = scheduler.tick();
        assert_eq!(tick.completed, Scheduler::DEFAULT_TICK_SIZE);
        assert!(tick.has_remaining);

        let tick = scheduler.tick();
        assert_eq!(tick.completed, 44);
        assert!(!tick.has_remaining);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn bypass_runs_successor_in_same_tick() {
        let _trace = crate::util::test::trace_init();
        let scheduler = Scheduler::new();
        let completed = Arc::new(AtomicUsize::new(0));

        let a = scheduler.defer({
            let completed = completed.clone();
            move || {
                completed.fetch_add(1, Ordering::SeqCst);
            }
        });
        let b = scheduler.defer({
            let completed = completed.clone();
            move || {
                completed.fetch_add(1, Ordering::SeqCst);
            }
        });

        a.add_successor(&b);
        a.submit();
        b.submit();

        let tick = scheduler.tick();

        // `b` was made ready by `a`'s completion and handed straight back to
        // the worker.
        assert_eq!(tick.completed, 2);
        assert_eq!(tick.bypassed, 1);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn unsubmitted_task_keeps_scheduler_busy() {
        let _trace = crate::util::test::trace_init();
        let scheduler = Scheduler::new();

        let a = scheduler.defer(|| ());
        assert!(!scheduler.is_idle());

        drop(a);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn empty_tick() {
        let _trace = crate::util::test::trace_init();
        let scheduler = Scheduler::new();

        let tick = scheduler.tick();
        assert_eq!(tick.completed, 0);
        assert!(!tick.has_remaining);
        assert!(scheduler.is_idle());
    }
}
