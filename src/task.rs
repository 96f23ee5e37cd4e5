//! Deferred, run-once tasks.
//!
//! A task is created in a deferred form, as a [`TaskHandle`], by
//! [`Scheduler::defer`] (or [`TaskHandle::new`], for custom executors).
//! While the handle is live, the task is guaranteed not to have started, so
//! it can still be wired into the dependency graph: it may be given
//! successors, be named as a successor of other tasks, or receive another
//! task's successors wholesale. Submitting the handle relinquishes the task
//! to its scheduler; from then on it is owned by exactly one place at a time
//! (its continuation, the run queue, or the worker executing it) until it
//! completes and is destroyed.
//!
//! The concrete body and scheduler types of a task are erased behind a
//! vtable, so the graph and the run queue operate on plain task pointers
//! wrapped in [`TaskRef`]s.
//!
//! [`Scheduler::defer`]: crate::scheduler::Scheduler::defer

use crate::loom::{
    cell::UnsafeCell,
    sync::atomic::{AtomicPtr, Ordering::*},
};
use crate::scheduler::Schedule;
use crate::util::non_null;

use alloc::boxed::Box;
use cordyceps::{mpsc_queue, Linked};
use core::{fmt, ptr, ptr::NonNull};

mod handle;
pub(crate) mod state;

pub use self::handle::{TaskCompletionHandle, TaskHandle};
use self::state::DynamicState;

/// An owning reference to a spawned task.
///
/// A `TaskRef` is how tasks travel between the dependency graph and a
/// scheduler: the graph hands a `TaskRef` to [`Schedule::schedule`] when the
/// task becomes runnable, and the scheduler's worker consumes it with
/// [`TaskRef::run`]. Once a task's [`TaskHandle`] has released it, there is
/// exactly one live `TaskRef` for it at any time.
pub struct TaskRef(NonNull<Header>);

/// The task header: the part of a task that the run queue and the dependency
/// graph operate on, independent of the task's body and scheduler types.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Header {
    /// The task's links in its scheduler's run queue.
    ///
    /// This must be the first field of the header (and the header the first
    /// field of the task), as the queue finds the links by casting a task
    /// pointer.
    run_queue: mpsc_queue::Links<Header>,

    /// The task's dependency state.
    ///
    /// Created lazily, the first time anything watches or wires this task;
    /// null means no one is watching, and the task completes silently.
    state: AtomicPtr<DynamicState>,

    vtable: &'static Vtable,
}

#[repr(C)]
struct Task<S, F> {
    header: Header,

    scheduler: S,

    /// The task body, taken exactly once, when the task runs.
    body: UnsafeCell<Option<F>>,
}

#[derive(Debug)]
struct Vtable {
    /// Execute the task body, then run the completion protocol. Returns at
    /// most one successor made ready, for direct execution by the caller.
    run: unsafe fn(NonNull<Header>) -> Option<TaskRef>,
    /// Hand the task to its scheduler's run queue.
    schedule: unsafe fn(NonNull<Header>),
    /// Destroy the task without running it.
    drop: unsafe fn(NonNull<Header>),
}

// === impl Task ===

macro_rules! trace_task {
    ($ptr:expr, $method:literal) => {
        trace!(task = ?$ptr, concat!("Task::", $method));
    };
}

impl<S, F> Task<S, F>
where
    S: Schedule + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    const TASK_VTABLE: Vtable = Vtable {
        run: Self::run,
        schedule: Self::schedule,
        drop: Self::drop_raw,
    };

    fn allocate(scheduler: S, body: F) -> Box<Self> {
        // The task participates in its scheduler's join accounting for as
        // long as it exists, whether or not it ever runs.
        scheduler.reserve();
        Box::new(Self {
            header: Header {
                run_queue: mpsc_queue::Links::new(),
                state: AtomicPtr::new(ptr::null_mut()),
                vtable: &Self::TASK_VTABLE,
            },
            scheduler,
            body: UnsafeCell::new(Some(body)),
        })
    }

    unsafe fn run(ptr: NonNull<Header>) -> Option<TaskRef> {
        trace_task!(ptr, "run");
        let this = ptr.cast::<Self>();

        let body = this.as_ref().body.with_mut(|body| (*body).take());
        debug_assert!(body.is_some(), "a task may only run once");
        if let Some(body) = body {
            body();
        }

        // The body has returned: release the task's successors, keeping the
        // first one made ready so the caller can run it directly.
        let next = Header::complete(ptr);
        Self::finalize(this);
        next
    }

    unsafe fn schedule(ptr: NonNull<Header>) {
        trace_task!(ptr, "schedule");
        let this = ptr.cast::<Self>();
        this.as_ref().scheduler.schedule(TaskRef(ptr));
    }

    unsafe fn drop_raw(ptr: NonNull<Header>) {
        trace_task!(ptr, "drop");
        Self::finalize(ptr.cast::<Self>());
    }

    unsafe fn finalize(this: NonNull<Self>) {
        let task = Box::from_raw(this.as_ptr());
        if let Some(state) = NonNull::new(task.header.state.load(Acquire)) {
            // Unregister the task as a co-owner of its dynamic state; any
            // completion handles keep the state alive after the task is gone.
            DynamicState::release(state);
        }
        task.scheduler.release();
    }
}

unsafe impl<S: Send, F: Send> Send for Task<S, F> {}
unsafe impl<S: Sync, F: Sync> Sync for Task<S, F> {}

impl<S, F> fmt::Debug for Task<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("header", &self.header).finish()
    }
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new<S, F>(scheduler: S, body: F) -> Self
    where
        S: Schedule + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let task = Task::allocate(scheduler, body);
        let ptr = unsafe { non_null(Box::into_raw(task)).cast::<Header>() };
        trace!(task = ?ptr, "TaskRef::new");
        Self(ptr)
    }

    /// Executes the task.
    ///
    /// This runs the task body, then releases the task's successors and
    /// destroys the task. If the completion made a successor task ready, the
    /// first such task is returned, and the caller — typically a worker that
    /// has just finished running this task — should execute it directly
    /// rather than going back through its run queue.
    pub fn run(self) -> Option<TaskRef> {
        let run = self.header().vtable.run;
        unsafe { run(self.0) }
    }

    /// Hands the task to its scheduler's run queue.
    pub(crate) fn enqueue(self) {
        let schedule = self.header().vtable.schedule;
        unsafe { schedule(self.0) }
    }

    /// Destroys the task without running it.
    pub(crate) fn finalize(self) {
        let drop = self.header().vtable.drop;
        unsafe { drop(self.0) }
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

// === impl Header ===

impl Header {
    /// Returns the task's dynamic state, creating it if it does not already
    /// exist.
    ///
    /// The state is created when:
    /// * a completion handle for the task is created
    /// * the first dependency edge touching the task is added
    /// * successors are transferred to the task
    unsafe fn get_or_create_state(this: NonNull<Self>) -> NonNull<DynamicState> {
        let current = this.as_ref().state.load(Acquire);
        if let Some(state) = NonNull::new(current) {
            return state;
        }

        let new = Box::into_raw(Box::new(DynamicState::new(this)));
        match this
            .as_ref()
            .state
            .compare_exchange(ptr::null_mut(), new, AcqRel, Acquire)
        {
            Ok(_) => {
                test_trace!(task = ?this, state = ?new, "created dynamic state");
                non_null(new)
            }
            Err(existing) => {
                // Another thread created the state first; discard ours.
                drop(Box::from_raw(new));
                non_null(existing)
            }
        }
    }

    /// Runs the completion half of the dependency protocol, returning the
    /// first successor made ready (if any) for direct execution.
    unsafe fn complete(this: NonNull<Self>) -> Option<TaskRef> {
        // A task without a dynamic state has no watchers and no successors.
        match NonNull::new(this.as_ref().state.load(Relaxed)) {
            Some(state) => state.as_ref().complete(),
            None => None,
        }
    }

    unsafe fn has_dependencies(this: NonNull<Self>) -> bool {
        match NonNull::new(this.as_ref().state.load(Relaxed)) {
            Some(state) => state.as_ref().has_dependencies(),
            None => false,
        }
    }

    /// Consumes the "not yet submitted" reservation on the task's
    /// continuation, returning the task if all of its predecessors have
    /// already completed.
    unsafe fn release_continuation(this: NonNull<Self>) -> Option<TaskRef> {
        let state = this.as_ref().state.load(Relaxed);
        debug_assert!(
            !state.is_null(),
            "release_continuation requested for a task without a dynamic state"
        );
        (*state).release_continuation()
    }

}

/// # Safety
///
/// A task must be pinned to be spawned.
unsafe impl Linked<mpsc_queue::Links<Header>> for Header {
    type Handle = TaskRef;

    fn into_ptr(task: Self::Handle) -> NonNull<Self> {
        task.0
    }

    /// Convert a raw pointer to a `Handle`.
    ///
    /// # Safety
    ///
    /// This function is safe to call when:
    /// - It is valid to construct a `Handle` from a raw pointer
    /// - The pointer points to a valid instance of `Self` (e.g. it does not
    ///   dangle).
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    /// Return the links of the node pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// This function is safe to call when:
    /// - It is valid to construct a `Handle` from a raw pointer
    /// - The pointer points to a valid instance of `Self` (e.g. it does not
    ///   dangle).
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        ptr.cast()
    }
}

unsafe impl Send for Header {}
unsafe impl Sync for Header {}
