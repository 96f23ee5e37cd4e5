//! The lock-free dependency state of a task.
//!
//! Three small control blocks cooperate here, without any locks:
//!
//! - A [`DynamicState`] describes one task to the rest of the graph: the
//!   list of successors waiting on it, the [`ContinuationVertex`] that other
//!   tasks decrement when they complete as its predecessors, and a
//!   forwarding pointer installed when the task hands its successors to a
//!   replacement. It is created lazily, so a task nobody watches or wires
//!   pays nothing and completes silently.
//!
//! - A [`ContinuationVertex`] is the join point that releases a task for
//!   execution. Its reference count starts at one — the "not yet submitted"
//!   reservation, consumed when the task's handle is submitted — and gains
//!   one reference per predecessor edge. The thread that drops the count to
//!   zero receives the task and either runs it directly or hands it to its
//!   scheduler; that transition happens exactly once.
//!
//! - A [`SuccessorNode`] is one edge out of a task: a link in the
//!   predecessor's successor list, holding a reservation on the successor's
//!   vertex.
//!
//! The successor list is a Treiber-style push stack with one twist: the
//! list head has a terminal sentinel value, [`COMPLETED`], installed with a
//! single atomic exchange when the task completes (or transfers its
//! successors away). Exactly one thread observes the `alive -> COMPLETED`
//! transition — the thread that performed the exchange — and only that
//! thread drains the claimed list. An inserter that loses its race against
//! the exchange finds the sentinel and consults the forwarding pointer:
//! either the successors moved to a replacement task (and the insert is
//! retried there), or the predecessor genuinely completed and the edge is
//! no longer needed.

use super::{Header, TaskRef};
use crate::loom::{
    alloc::Track,
    cell::UnsafeCell,
    sync::atomic::{self, AtomicPtr, AtomicUsize, Ordering::*},
};
use crate::util::non_null;

use alloc::boxed::Box;
use core::{fmt, ptr, ptr::NonNull};

/// A task's dependency state.
///
/// Co-owned (via `refs`) by the task itself, by every live
/// [`TaskCompletionHandle`], and — once this state has forwarded its
/// successors — by each state that forwarded here. Deleted by the last
/// releaser.
///
/// [`TaskCompletionHandle`]: crate::task::TaskCompletionHandle
pub(crate) struct DynamicState {
    /// The task this state describes.
    ///
    /// Not owned: the task is owned by its handle, its continuation, or its
    /// scheduler, and may be destroyed while this state is still alive (a
    /// completion handle keeps the state, never the task). The pointer is
    /// only dereferenced on paths that hold the task alive.
    task: NonNull<Header>,

    /// Head of the successor list, or [`COMPLETED`] once the task has
    /// completed (or transferred its successors) and the list was drained.
    successors: AtomicPtr<SuccessorNode>,

    /// The continuation vertex other tasks decrement when they complete as
    /// this task's predecessors. Created lazily by the first edge; cleared
    /// when the vertex fires.
    vertex: AtomicPtr<ContinuationVertex>,

    /// The state that received this task's successors, or null if they were
    /// never transferred.
    ///
    /// Written once, before `successors` is sealed; read only after an
    /// acquire load of `successors` observed [`COMPLETED`], so a relaxed
    /// store/load pair suffices — both sides synchronize through
    /// `successors`.
    forward: AtomicPtr<DynamicState>,

    refs: AtomicUsize,

    _track: Track<()>,
}

/// The join point that releases a task once its predecessors have completed.
pub(crate) struct ContinuationVertex {
    /// The task released when the count reaches zero.
    ///
    /// Not owned; whoever drops the count to zero receives ownership of the
    /// task from its (already released) handle.
    task: NonNull<Header>,

    refs: AtomicUsize,

    _track: Track<()>,
}

/// One edge out of a task: a node in the singly-linked successor list.
pub(crate) struct SuccessorNode {
    /// The next node in the list.
    ///
    /// Plain (non-atomic): only written while the node is unreachable —
    /// before the publishing compare-exchange succeeds, or while draining a
    /// list that has already been claimed with an exchange.
    next: UnsafeCell<*mut SuccessorNode>,

    /// The successor's continuation vertex. The node holds one reservation
    /// on the vertex, taken when the edge was created and released when the
    /// node is drained or discarded.
    vertex: NonNull<ContinuationVertex>,

    _track: Track<()>,
}

/// Terminal sentinel for the successor list head: the task has completed
/// (or transferred its successors) and the list has been drained. Never
/// dereferenced, and never replaced once installed.
const COMPLETED: *mut SuccessorNode = usize::MAX as *mut SuccessorNode;

/// Refcounts above this are assumed to be leaks (e.g. `mem::forget` in a
/// loop), and panic rather than risking overflow into a use-after-free.
const MAX_REFS: usize = isize::MAX as usize;

// === impl DynamicState ===

impl DynamicState {
    /// Returns a new state describing `task`, with one reference reserved
    /// for the task's own co-ownership.
    pub(super) fn new(task: NonNull<Header>) -> Self {
        Self {
            task,
            successors: AtomicPtr::new(ptr::null_mut()),
            vertex: AtomicPtr::new(ptr::null_mut()),
            forward: AtomicPtr::new(ptr::null_mut()),
            refs: AtomicUsize::new(1),
            _track: Track::new(()),
        }
    }

    /// Registers another co-owner of this state.
    pub(super) fn reserve(&self) {
        // Incrementing can be relaxed: a new reference can only be created
        // from an existing one, and passing that existing reference between
        // threads already provides the required synchronization.
        let refs = self.refs.fetch_add(1, Relaxed);
        assert!(refs <= MAX_REFS, "dynamic state reference count overflow");
    }

    /// Unregisters a co-owner, deleting the state if it was the last.
    ///
    /// If the state forwarded its successors, it holds one reservation on
    /// the replacement state; that reservation is handed back here, walking
    /// the forwarding chain iteratively rather than recursing through it.
    pub(super) unsafe fn release(mut this: NonNull<Self>) {
        loop {
            let refs = this.as_ref().refs.fetch_sub(1, Release);
            debug_assert!(refs > 0, "released a dynamic state with no references");
            if refs != 1 {
                return;
            }

            // This was the last reference: synchronize with all previous
            // co-owners before tearing the state down.
            atomic::fence(Acquire);
            let forward = this.as_ref().forward.load(Relaxed);
            test_trace!(state = ?this, "deleting dynamic state");
            drop(Box::from_raw(this.as_ptr()));

            match NonNull::new(forward) {
                Some(next) => this = next,
                None => return,
            }
        }
    }

    /// Returns `true` if a predecessor edge is currently pending for this
    /// task: a continuation vertex exists and has not yet fired.
    pub(super) fn has_dependencies(&self) -> bool {
        !self.vertex.load(Acquire).is_null()
    }

    /// Publishes "this task currently has no pending predecessor edge".
    fn unset_dependency(&self) {
        self.vertex.store(ptr::null_mut(), Release);
    }

    /// Returns this task's continuation vertex, creating it (with the "not
    /// yet submitted" reservation) if no predecessor has linked to the task
    /// before.
    pub(super) fn continuation_vertex(&self) -> NonNull<ContinuationVertex> {
        let current = self.vertex.load(Acquire);
        if let Some(vertex) = NonNull::new(current) {
            return vertex;
        }

        let new = Box::into_raw(Box::new(ContinuationVertex::new(self.task)));
        match self
            .vertex
            .compare_exchange(ptr::null_mut(), new, AcqRel, Acquire)
        {
            Ok(_) => {
                test_trace!(task = ?self.task, vertex = ?new, "created continuation vertex");
                unsafe { non_null(new) }
            }
            Err(existing) => unsafe {
                // Another thread created the vertex first; discard ours.
                drop(Box::from_raw(new));
                non_null(existing)
            },
        }
    }

    /// Adds an edge from this task to the task owning `vertex`: once this
    /// task completes, it will release one reservation on `vertex`.
    ///
    /// If this task has already completed, the edge is either redirected to
    /// the state that received this task's successors, or — when there is
    /// no such state — elided entirely, since the dependency it describes is
    /// already satisfied.
    pub(super) unsafe fn add_successor(mut this: NonNull<Self>, vertex: NonNull<ContinuationVertex>) {
        loop {
            let state = this.as_ref();
            let head = state.successors.load(Acquire);
            if head != COMPLETED {
                vertex.as_ref().reserve();
                let node = NonNull::from(Box::leak(Box::new(SuccessorNode::new(vertex))));
                Self::add_successor_node(this, node);
                return;
            }

            match NonNull::new(state.forward.load(Relaxed)) {
                // The successors moved to a replacement task; the new edge
                // belongs to it as well.
                Some(next) => this = next,
                None => {
                    test_trace!(state = ?this, "add_successor: predecessor already completed");
                    return;
                }
            }
        }
    }

    /// Links `node` at the head of the successor list, tolerating concurrent
    /// inserts, completion, and transfer.
    unsafe fn add_successor_node(mut this: NonNull<Self>, node: NonNull<SuccessorNode>) {
        loop {
            let state = this.as_ref();
            let mut head = state.successors.load(Acquire);

            while head != COMPLETED {
                // The node is not yet reachable, so its next pointer can be
                // updated on every retry.
                node.as_ref().set_next(head);
                match state.successors.compare_exchange_weak(
                    head,
                    node.as_ptr(),
                    AcqRel,
                    Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => head = actual,
                }
            }

            // The task completed (or transferred its successors) while we
            // were inserting.
            match NonNull::new(state.forward.load(Relaxed)) {
                // Ownership of the node moves to the receiving state.
                Some(next) => this = next,
                None => {
                    // Genuine completion: the dependency is already
                    // satisfied. Undo the reservation taken for this edge
                    // and discard the node.
                    test_trace!(state = ?this, node = ?node, "add_successor_node: lost race to completion");
                    ContinuationVertex::release(node.as_ref().vertex);
                    SuccessorNode::finalize(node);
                    return;
                }
            }
        }
    }

    /// Splices an entire claimed successor list onto this state's head.
    ///
    /// Only used by the transfer protocol. The caller guarantees that this
    /// state belongs to a task that has not yet been submitted, so the list
    /// cannot be sealed concurrently; it may, however, be receiving
    /// concurrent single-node inserts, which is why the head is installed
    /// with a compare-exchange and `last.next` is re-pointed on every retry.
    unsafe fn add_successor_list(&self, list: *mut SuccessorNode) {
        let Some(first) = NonNull::new(list) else {
            // The claimed list was empty.
            return;
        };

        let mut last = first;
        while let Some(next) = NonNull::new(last.as_ref().next()) {
            last = next;
        }

        let mut head = self.successors.load(Acquire);
        loop {
            debug_assert!(
                head != COMPLETED,
                "a task may only receive transferred successors before it is submitted"
            );
            last.as_ref().set_next(head);
            match self
                .successors
                .compare_exchange_weak(head, first.as_ptr(), AcqRel, Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Moves every pending successor of this task to `target`, and arranges
    /// for successors added later to be redirected there.
    ///
    /// The forwarding pointer is published *before* the list is sealed: an
    /// inserter that loses its race against the exchange below observes
    /// [`COMPLETED`] and is guaranteed to find `target` behind it.
    pub(super) unsafe fn transfer_successors_to(this: NonNull<Self>, target: NonNull<Self>) {
        // The target holds successors on behalf of this state; register a
        // co-ownership that this state's own release will hand back.
        target.as_ref().reserve();
        this.as_ref().forward.store(target.as_ptr(), Relaxed);

        // Claim the list and seal this state in a single step.
        let list = this.as_ref().successors.swap(COMPLETED, AcqRel);
        if list == COMPLETED {
            // The task had already completed and drained its list; there is
            // nothing left to move. (Edges added from now on are still
            // redirected to the target.)
            return;
        }
        test_trace!(from = ?this, to = ?target, "transferring successors");
        target.as_ref().add_successor_list(list);
    }

    /// Seals and drains the successor list after the task's body has
    /// returned, releasing one reservation on each successor's vertex.
    ///
    /// The first successor this makes ready is returned rather than
    /// scheduled, so the worker completing this task can execute it directly
    /// (work bypass); any further ready successors are handed to their own
    /// schedulers.
    pub(super) unsafe fn complete(&self) -> Option<TaskRef> {
        let mut node = test_dbg!(self.successors.swap(COMPLETED, AcqRel));
        if node == COMPLETED {
            // Already sealed: the successors were transferred to a
            // replacement task before this one completed.
            return None;
        }

        let mut bypass = None;
        while let Some(this_node) = NonNull::new(node) {
            node = this_node.as_ref().next();
            if let Some(task) = ContinuationVertex::release_bypass(this_node.as_ref().vertex) {
                test_trace!(successor = ?task, "complete: successor ready");
                match bypass {
                    None => bypass = Some(task),
                    // The completing worker can only take one task; the rest
                    // go through their schedulers.
                    Some(_) => task.enqueue(),
                }
            }
            SuccessorNode::finalize(this_node);
        }
        bypass
    }

    /// Consumes the "not yet submitted" reservation on the continuation
    /// vertex, returning the task if every predecessor has already
    /// completed. Called when the task's handle is finally submitted.
    pub(super) unsafe fn release_continuation(&self) -> Option<TaskRef> {
        let vertex = self.vertex.load(Acquire);
        debug_assert!(
            !vertex.is_null(),
            "release_continuation requested for a task without dependencies"
        );
        ContinuationVertex::release_bypass(non_null(vertex))
    }
}

impl fmt::Debug for DynamicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicState")
            .field("task", &self.task)
            .field("successors", &self.successors)
            .field("vertex", &self.vertex)
            .field("forward", &self.forward)
            .field("refs", &self.refs)
            .finish()
    }
}

// === impl ContinuationVertex ===

impl ContinuationVertex {
    /// Returns a new vertex for `task`, with one reference reserved for the
    /// task handle that owns the task: submitting the handle releases it,
    /// which is what keeps the task from being released by a fast
    /// predecessor before the client has finished wiring the graph.
    fn new(task: NonNull<Header>) -> Self {
        Self {
            task,
            refs: AtomicUsize::new(1),
            _track: Track::new(()),
        }
    }

    /// Reserves one reference, on behalf of a newly linked successor node.
    fn reserve(&self) {
        let refs = self.refs.fetch_add(1, Relaxed);
        assert!(
            refs <= MAX_REFS,
            "continuation vertex reference count overflow"
        );
    }

    /// Releases one reference without ever scheduling the task; if it was
    /// the last, the vertex is deleted. Used on cleanup paths where the
    /// dependency an edge described turned out to be already satisfied.
    unsafe fn release(this: NonNull<Self>) {
        let refs = this.as_ref().refs.fetch_sub(1, Release);
        debug_assert!(refs > 0, "released a continuation vertex with no references");
        if refs == 1 {
            atomic::fence(Acquire);
            drop(Box::from_raw(this.as_ptr()));
        }
    }

    /// Releases one reference; if it was the last, returns the task for the
    /// caller to run or schedule, and deletes the vertex.
    ///
    /// The count reaches zero at most once, so the returned task is handed
    /// out exactly once across all predecessor completions and the
    /// submission path combined.
    unsafe fn release_bypass(this: NonNull<Self>) -> Option<TaskRef> {
        let refs = test_dbg!(this.as_ref().refs.fetch_sub(1, Release));
        debug_assert!(refs > 0, "released a continuation vertex with no references");
        if refs != 1 {
            return None;
        }

        atomic::fence(Acquire);
        let task = this.as_ref().task;

        // The task is about to be handed to a scheduler: it no longer has a
        // pending predecessor edge.
        let state = task.as_ref().state.load(Acquire);
        debug_assert!(
            !state.is_null(),
            "a task with a continuation vertex must have a dynamic state"
        );
        (*state).unset_dependency();

        test_trace!(task = ?task, "all predecessors completed");
        drop(Box::from_raw(this.as_ptr()));
        Some(TaskRef(task))
    }
}

impl fmt::Debug for ContinuationVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationVertex")
            .field("task", &self.task)
            .field("refs", &self.refs)
            .finish()
    }
}

// === impl SuccessorNode ===

impl SuccessorNode {
    fn new(vertex: NonNull<ContinuationVertex>) -> Self {
        Self {
            next: UnsafeCell::new(ptr::null_mut()),
            vertex,
            _track: Track::new(()),
        }
    }

    /// # Safety
    ///
    /// May only be called while the node is unreachable from other threads
    /// (pre-publication) or while its list is owned by the draining thread.
    unsafe fn next(&self) -> *mut SuccessorNode {
        self.next.with(|next| *next)
    }

    /// # Safety
    ///
    /// May only be called while the node is unreachable from other threads.
    unsafe fn set_next(&self, node: *mut SuccessorNode) {
        self.next.with_mut(|next| *next = node)
    }

    unsafe fn finalize(this: NonNull<Self>) {
        drop(Box::from_raw(this.as_ptr()));
    }
}

impl fmt::Debug for SuccessorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SuccessorNode { ... }")
    }
}
