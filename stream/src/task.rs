//! Stackful tasks: the unit the [`crate::scheduler::Scheduler`] runs.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use fiber::stack::DefaultFiberStack;
use fiber::{Fiber, FiberResult, Suspend};
use linked_list::{Linked, Links};
use tracing::trace;

use crate::context::StreamContext;
use crate::scheduler::Scheduler;

/// Default stack size for a task's fiber.
pub const TASK_STACK_SIZE: usize = 256 * 1024;

type TaskFiber = Fiber<(), (), (), (), DefaultFiberStack>;

struct TaskState {
    fiber: Option<TaskFiber>,
    /// The task to wake when this task finishes, if one is waiting on it.
    notify: Option<Arc<Task>>,
    /// Tasks this task is waiting on, set only while it is itself suspended in
    /// `wait_any`. Weak because ownership of those tasks belongs to the run queue
    /// or to their own `notify` edges, not to the waiter.
    others: Vec<Weak<Task>>,
}

/// A single stackful unit of cooperative work, always held behind an [`Arc`].
///
/// Intrusively linked into the scheduler's run queue and free list; the `notify`
/// back-edge from a task's `others` keeps a parked waiter alive without it
/// belonging to any list at all.
pub struct Task {
    links: Links<Task>,
    scheduler: Arc<Scheduler>,
    /// Whether this task's fiber has returned. Kept out of `TaskState` (and
    /// thus out of the single-resumer discipline guarding it) because `done()`
    /// is a safe, externally-callable query with no mutex to serialize it
    /// against `run_fiber`'s write.
    done: AtomicBool,
    state: UnsafeCell<TaskState>,
}

// Safety: `state` is only ever accessed while the owning `Scheduler`'s run-queue
// discipline guarantees at most one thread is driving (or mutating bookkeeping
// for) a given task at a time; see `Scheduler::run_once` and `Scheduler::task_done`.
unsafe impl Send for Task {}
// Safety: see above; cross-thread sharing of `Arc<Task>` itself (e.g. a `notify`
// edge cloned into a device-completion closure run on another thread) never
// races with the scheduler's own access because the scheduler mutex serializes it.
unsafe impl Sync for Task {}

impl Task {
    /// Creates a new task bound to `scheduler`, reusing a stack (and, where
    /// possible, the `Task` allocation itself) from the scheduler's free list.
    pub fn new(
        scheduler: &Arc<Scheduler>,
        func: impl FnOnce(TaskHandle<'_>) + Send + 'static,
    ) -> Arc<Task> {
        let reused = scheduler.take_empty_task();

        let task = reused.unwrap_or_else(|| {
            Arc::new(Task {
                links: Links::new(),
                scheduler: Arc::clone(scheduler),
                done: AtomicBool::new(false),
                state: UnsafeCell::new(TaskState {
                    fiber: None,
                    notify: None,
                    others: Vec::new(),
                }),
            })
        });

        // Safety: `task` was either just allocated or taken off the scheduler's
        // empty-task free list, which only ever holds tasks with no other `Arc`
        // clone outstanding; either way we have exclusive access to its state.
        let state = unsafe { &mut *task.state.get() };
        let stack = match state.fiber.take() {
            Some(fiber) => fiber.into_stack(),
            None => DefaultFiberStack::new(TASK_STACK_SIZE).expect("failed to allocate task stack"),
        };
        task.done.store(false, Ordering::Relaxed);
        state.notify = None;
        state.others.clear();

        let task_for_closure = Arc::clone(&task);
        state.fiber = Some(TaskFiber::with_stack(stack, move |(), suspend, _local: &()| {
            func(TaskHandle {
                task: task_for_closure,
                suspend,
            });
        }));

        trace!("task created");
        task
    }

    /// Resumes this task's fiber on the calling thread until it next yields or
    /// returns. Intended for foreign code (e.g. a device completion callback) to
    /// resume a task it knows to be suspended; the scheduler itself calls the
    /// same primitive internally via [`Scheduler::run_once`].
    ///
    /// Caller must ensure `self` is not concurrently being resumed elsewhere.
    pub fn resume(self: &Arc<Self>) {
        let scheduler = Arc::clone(&self.scheduler);
        scheduler.run_once(self);
    }

    /// Whether this task's fiber has returned. Safe to call from any thread;
    /// under a race with a concurrent `run_fiber` the caller may observe a
    /// stale `false`, which is always a valid answer to "is this task
    /// currently known to be done".
    #[must_use]
    pub fn done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    pub(crate) fn run_fiber(&self) -> FiberResult<(), ()> {
        // Safety: caller (`Scheduler::run_once`) holds the single-resumer
        // discipline for this task.
        let state = unsafe { &mut *self.state.get() };
        let fiber = state.fiber.as_mut().expect("task fiber missing");
        let result = fiber.resume(());
        if matches!(result, FiberResult::Return(())) {
            self.done.store(true, Ordering::Relaxed);
        }
        result
    }

    pub(crate) fn take_notify(&self) -> Option<Arc<Task>> {
        // Safety: called only from `Scheduler::task_done`, under the scheduler
        // mutex, after this task has transitioned to `done`.
        unsafe { (*self.state.get()).notify.take() }
    }

    pub(crate) fn take_others(&self) -> Vec<Weak<Task>> {
        // Safety: see `take_notify`.
        unsafe { std::mem::take(&mut (*self.state.get()).others) }
    }

    pub(crate) fn clear_notify(&self) {
        // Safety: see `take_notify`; called under the scheduler mutex.
        unsafe {
            (*self.state.get()).notify = None;
        }
    }

    pub(crate) fn set_notify(&self, waiter: Arc<Task>) {
        // Safety: called from `TaskHandle::wait_any` while holding the scheduler
        // mutex, which serializes this against `Scheduler::task_done`.
        let state = unsafe { &mut *self.state.get() };
        assert!(state.notify.is_none(), "task already has a notifier registered");
        state.notify = Some(waiter);
    }

    pub(crate) fn notify_is_set(&self) -> bool {
        // Safety: see `set_notify`.
        unsafe { (*self.state.get()).notify.is_some() }
    }

    pub(crate) fn set_others(&self, others: Vec<Weak<Task>>) {
        // Safety: called only by the task itself, from within its own fiber,
        // before it suspends; nothing else touches `others` until it resumes.
        unsafe {
            (*self.state.get()).others = others;
        }
    }
}

// Safety: `Links<Task>` lives at a fixed offset inside `Task`; `Task` is always
// heap-allocated behind `Arc` so its address is stable for as long as any handle
// (including an intrusive-list entry) exists.
unsafe impl Linked for Task {
    type Handle = Arc<Task>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        let raw = Arc::into_raw(handle);
        // Safety: `Arc::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(raw.cast_mut()) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: forwarded from caller; `ptr` must have come from `into_ptr`.
        unsafe { Arc::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<Links<Self>> {
        // Safety: `links` is a field of `Task` at a fixed offset; `target` is a
        // valid, live `Task` pointer per the trait's contract.
        unsafe { target.map_addr(|addr| addr + std::mem::offset_of!(Task, links)).cast() }
    }
}

/// Handle passed to a task's body, giving it access to the suspension point the
/// scheduler drives it through.
pub struct TaskHandle<'a> {
    task: Arc<Task>,
    suspend: &'a Suspend<(), ()>,
}

impl TaskHandle<'_> {
    /// Suspends the running task until `ctx`'s queued device work completes.
    ///
    /// A `None` context, or a CPU-variant context, is a no-op (CPU work is
    /// synchronous with respect to the task that issued it).
    pub fn synchronize(&self, ctx: Option<&StreamContext>) {
        let Some(ctx) = ctx else { return };
        let Some((adapter, handle)) = ctx.device_parts() else {
            return;
        };

        let scheduler = Arc::clone(&self.task.scheduler);
        scheduler.begin_stream_wait();

        let task = Arc::clone(&self.task);
        let scheduler_for_cb = Arc::clone(&scheduler);
        adapter.task_synchronize(
            handle,
            Box::new(move || {
                task.resume();
                scheduler_for_cb.end_stream_wait();
            }),
        );

        trace!("task suspending for device synchronize");
        self.suspend.suspend(());
    }

    /// Suspends the running task until any one of `others` finishes.
    ///
    /// Exactly one wakeup is delivered: whichever task in `others` finishes
    /// first notifies this task and clears the notifier on all remaining
    /// siblings.
    pub fn wait_any(&self, others: &[Arc<Task>]) {
        assert!(!others.is_empty(), "wait_any requires at least one task");

        self.task.scheduler.register_wait_any(&self.task, others);

        trace!(count = others.len(), "task suspending for wait_any");
        self.suspend.suspend(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn task_runs_to_completion() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let task = Task::new(&scheduler, move |_handle| {
            ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        scheduler.schedule_task(task);
        scheduler.wait_idle();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
