//! Ownership handles for deferred tasks.

use super::{state::DynamicState, Header, TaskRef};
use crate::scheduler::Schedule;

use core::{fmt, mem, ptr::NonNull};

/// Exclusive ownership of a task that has not yet been submitted for
/// execution.
///
/// While a `TaskHandle` is live, its task is guaranteed not to have started,
/// so the task can still be wired into the dependency graph:
/// [`add_successor`] orders another deferred task after this one, and
/// [`transfer_successors_to`] moves this task's pending successors to a
/// replacement. Because wiring borrows the handle and [`submit`] consumes
/// it, the borrow checker enforces that no edge can be added to a task after
/// it has been submitted.
///
/// Dropping a handle without submitting it destroys the task; its body is
/// never run. If predecessor edges were already added to the dropped task,
/// its continuation vertex is leaked (releasing its submission reservation
/// instead would let a late-completing predecessor schedule the destroyed
/// task).
///
/// A `TaskHandle` may be sent to another thread, but is single-owner by
/// contract and may not be shared between threads.
///
/// [`add_successor`]: TaskHandle::add_successor
/// [`transfer_successors_to`]: TaskHandle::transfer_successors_to
/// [`submit`]: TaskHandle::submit
#[must_use = "dropping a `TaskHandle` destroys the task without running it"]
pub struct TaskHandle {
    task: NonNull<Header>,
}

/// A shared observer of a task's dependency state.
///
/// Unlike a [`TaskHandle`], a completion handle does not own the task, and
/// it outlives submission: it can name the task as a predecessor of new
/// edges while the task is queued, running, or already completed. Cloning a
/// completion handle registers another co-owner of the underlying dependency
/// state; dropping the last one releases the state but does not cancel or
/// otherwise affect the task.
///
/// Two completion handles compare equal when they observe the same task.
pub struct TaskCompletionHandle {
    state: NonNull<DynamicState>,
}

// === impl TaskHandle ===

impl TaskHandle {
    /// Creates a new deferred task that will run `body` on `scheduler` once
    /// it is [submitted](TaskHandle::submit) and all of its predecessors
    /// have completed.
    ///
    /// Most callers want [`Scheduler::defer`] instead; this is the
    /// entry point for custom [`Schedule`] implementations.
    ///
    /// [`Scheduler::defer`]: crate::scheduler::Scheduler::defer
    pub fn new<S, F>(scheduler: S, body: F) -> Self
    where
        S: Schedule + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            task: TaskRef::new(scheduler, body).0,
        }
    }

    /// Submits the task for execution, consuming the handle.
    ///
    /// A task with no pending predecessors is handed to its scheduler
    /// immediately. Otherwise, submission consumes the task's "not yet
    /// submitted" reservation, and the task is scheduled by whichever
    /// predecessor completes last — or right here, if they all already have.
    pub fn submit(self) {
        let task = self.task;
        mem::forget(self);
        unsafe {
            if Header::has_dependencies(task) {
                if let Some(ready) = Header::release_continuation(task) {
                    ready.enqueue();
                }
            } else {
                TaskRef(task).enqueue();
            }
        }
    }

    /// Adds a dependency edge: `succ` may not run until this task has
    /// completed.
    ///
    /// The same edge may be added multiple times; each addition is honored
    /// (and they all collapse once this task completes).
    pub fn add_successor(&self, succ: &TaskHandle) {
        unsafe {
            let pred = Header::get_or_create_state(self.task);
            let vertex = Header::get_or_create_state(succ.task)
                .as_ref()
                .continuation_vertex();
            DynamicState::add_successor(pred, vertex);
        }
    }

    /// Moves every pending successor of this task to `target`, so that
    /// completing `target` (rather than this task) releases them. Successors
    /// added to this task afterwards are redirected to `target` as well.
    ///
    /// This is the retirement protocol: a task that has delegated its work
    /// to a replacement hands over its outgoing edges in one atomic step, so
    /// none of them can fire early or get lost.
    pub fn transfer_successors_to(&self, target: &TaskHandle) {
        unsafe {
            // The source state is created even if this task was never wired:
            // it records the forwarding pointer, so that edges added to this
            // task from now on are redirected to `target` as well.
            let state = Header::get_or_create_state(self.task);
            let target_state = Header::get_or_create_state(target.task);
            DynamicState::transfer_successors_to(state, target_state);
        }
    }

    /// Returns `true` if predecessor edges have been added to this task.
    ///
    /// This remains `true` even once every predecessor has completed: the
    /// pending edge is only consumed when the task is submitted.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        unsafe { Header::has_dependencies(self.task) }
    }

    /// Returns a [`TaskCompletionHandle`] observing this task.
    #[must_use]
    pub fn completion_handle(&self) -> TaskCompletionHandle {
        let state = unsafe { Header::get_or_create_state(self.task) };
        unsafe { state.as_ref().reserve() };
        TaskCompletionHandle { state }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        // The "changed my mind" path: the task is destroyed without ever
        // running its body.
        TaskRef(self.task).finalize();
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("task", &self.task).finish()
    }
}

unsafe impl Send for TaskHandle {}

// === impl TaskCompletionHandle ===

impl TaskCompletionHandle {
    /// Adds a dependency edge: `succ` may not run until the observed task
    /// has completed.
    ///
    /// If the observed task has already completed, the edge is a no-op
    /// (unless the task transferred its successors to a replacement, in
    /// which case the edge is installed on the replacement), and `succ` is
    /// released as soon as it is submitted.
    pub fn add_successor(&self, succ: &TaskHandle) {
        unsafe {
            let vertex = Header::get_or_create_state(succ.task)
                .as_ref()
                .continuation_vertex();
            DynamicState::add_successor(self.state, vertex);
        }
    }

    /// Moves every pending successor of the observed task to `target`.
    ///
    /// This must happen before the observed task completes — transferring
    /// from within the task's own body is fine, as completion runs only
    /// after the body returns. If the task has already completed, its
    /// successors have already been released and nothing is moved, but
    /// edges added through this handle afterwards are still redirected to
    /// `target`.
    pub fn transfer_successors_to(&self, target: &TaskHandle) {
        unsafe {
            let target_state = Header::get_or_create_state(target.task);
            DynamicState::transfer_successors_to(self.state, target_state);
        }
    }
}

impl Clone for TaskCompletionHandle {
    fn clone(&self) -> Self {
        // Register one more co-owner of the dynamic state.
        unsafe { self.state.as_ref().reserve() };
        Self { state: self.state }
    }
}

impl Drop for TaskCompletionHandle {
    fn drop(&mut self) {
        unsafe { DynamicState::release(self.state) }
    }
}

impl PartialEq for TaskCompletionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl Eq for TaskCompletionHandle {}

impl fmt::Debug for TaskCompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompletionHandle")
            .field("state", &self.state)
            .finish()
    }
}

unsafe impl Send for TaskCompletionHandle {}
unsafe impl Sync for TaskCompletionHandle {}
