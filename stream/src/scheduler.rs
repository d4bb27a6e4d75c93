//! The M:1 cooperative scheduler: one worker thread per stream context,
//! multiplexing any number of stackful [`Task`]s.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use linked_list::List;
use tracing::{debug, trace};

use crate::task::Task;

struct Inner {
    run_queue: List<Task>,
    /// `true` while some thread (inline drain or the blocking worker) is
    /// actively draining this scheduler's run queue.
    active: bool,
    /// Tasks currently suspended waiting on device-stream completion; counted
    /// separately from the run queue because they hold no queue entry while
    /// parked, but still keep the scheduler "busy" for idle-detection purposes.
    stream_wait_task_count: usize,
    /// Finished tasks, kept around (fiber done, stack retained) so a future
    /// `Task::new` can reuse the allocation and its stack instead of mapping a
    /// fresh one.
    empty_tasks: Vec<Arc<Task>>,
    worker: Option<JoinHandle<()>>,
}

/// Owns the run queue and free list for one stream context's worker.
///
/// Two condition variables coordinate the worker thread: `wait` wakes a parked
/// worker when new work appears, `notify` wakes anyone blocked in
/// [`Scheduler::wait_idle`] once the scheduler goes idle.
pub struct Scheduler {
    inner: Mutex<Inner>,
    wait: Condvar,
    notify: Condvar,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                run_queue: List::new(),
                active: false,
                stream_wait_task_count: 0,
                empty_tasks: Vec::new(),
                worker: None,
            }),
            wait: Condvar::new(),
            notify: Condvar::new(),
        })
    }

    /// Adds `task` to the run queue. If the scheduler is idle, drains it inline
    /// on the calling thread; otherwise wakes a parked worker (if any) so it
    /// notices the new task.
    pub fn schedule_task(self: &Arc<Self>, task: Arc<Task>) {
        let mut inner = self.inner.lock().unwrap();
        inner.run_queue.push_back(task);
        let already_active = inner.active;
        drop(inner);

        if already_active {
            self.wait.notify_one();
        } else {
            trace!("scheduler starting inline drain");
            self.try_drain();
        }
    }

    /// Non-blocking: drains the run queue on the calling thread until it's
    /// empty, a stream-suspended task is the only thing left, or the scheduler
    /// goes fully idle. If tasks remain suspended on device work, spawns a
    /// worker thread to keep draining and returns immediately.
    fn try_drain(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active {
            return;
        }
        inner.active = true;

        loop {
            if inner.run_queue.is_empty() && inner.stream_wait_task_count == 0 {
                inner.active = false;
                debug!("scheduler idle");
                self.notify.notify_all();
                return;
            }

            if inner.run_queue.is_empty() {
                debug!("spawning blocking worker for outstanding stream waits");
                let scheduler = Arc::clone(self);
                inner.worker = Some(std::thread::spawn(move || scheduler.blocking_worker()));
                return;
            }

            let task = inner.run_queue.pop_front().expect("checked non-empty above");
            drop(inner);
            self.run_once(&task);
            inner = self.inner.lock().unwrap();
        }
    }

    /// Blocking variant of the drain loop: runs on its own thread, parking on
    /// the `wait` condition variable whenever the run queue is empty but some
    /// task remains suspended on device completion.
    fn blocking_worker(self: Arc<Self>) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            loop {
                if inner.run_queue.is_empty() && inner.stream_wait_task_count == 0 {
                    inner.active = false;
                    debug!("blocking worker exiting, scheduler idle");
                    self.notify.notify_all();
                    return;
                }
                if inner.run_queue.is_empty() {
                    inner = self.wait.wait(inner).unwrap();
                    continue;
                }
                break;
            }
            let task = inner.run_queue.pop_front().expect("checked non-empty above");
            drop(inner);
            self.run_once(&task);
        }
    }

    /// Resumes `task`'s fiber once, then runs the task-done protocol if it
    /// finished. Shared by the drain loops and by [`Task::resume`].
    pub(crate) fn run_once(self: &Arc<Self>, task: &Arc<Task>) {
        let result = task.run_fiber();
        if matches!(result, fiber::FiberResult::Return(())) {
            self.task_done(task);
        }
    }

    /// Runs when `task` has finished: wakes its waiter (if any) and pushes
    /// `task` itself onto the free list for reuse.
    fn task_done(self: &Arc<Self>, task: &Arc<Task>) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(waiter) = task.take_notify() {
            trace!("task-done: waking wait_any waiter");
            inner.run_queue.push_back(Arc::clone(&waiter));

            for other in waiter.take_others() {
                let Some(other) = other.upgrade() else { continue };
                if !Arc::ptr_eq(&other, task) {
                    debug_assert!(other.notify_is_set());
                    other.clear_notify();
                }
            }
        }

        inner.empty_tasks.push(Arc::clone(task));
    }

    pub(crate) fn take_empty_task(&self) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock().unwrap();
        inner.empty_tasks.pop()
    }

    /// Registers `waiter` as the task to resume once any of `others` finishes.
    pub(crate) fn register_wait_any(&self, waiter: &Arc<Task>, others: &[Arc<Task>]) {
        let _inner = self.inner.lock().unwrap();
        waiter.set_others(others.iter().map(Arc::downgrade).collect::<Vec<Weak<Task>>>());
        for other in others {
            other.set_notify(Arc::clone(waiter));
        }
    }

    pub(crate) fn begin_stream_wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stream_wait_task_count += 1;
    }

    pub(crate) fn end_stream_wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stream_wait_task_count -= 1;
        drop(inner);
        self.wait.notify_one();
    }

    /// Blocks the calling thread until the scheduler has no runnable or
    /// stream-suspended tasks left.
    pub fn wait_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.active {
            inner = self.notify.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceAdapter, DeviceHandle};
    use crate::signal::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    #[test]
    fn idle_scheduler_drains_immediately() {
        let scheduler = Scheduler::new();
        scheduler.wait_idle();
    }

    #[test]
    fn wait_any_wakes_exactly_once() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let scheduler = Scheduler::new();
        let wakeups = Arc::new(AtomicUsize::new(0));

        let a = Task::new(&scheduler, |_h| {});
        let b = Task::new(&scheduler, |_h| {});
        let c = Task::new(&scheduler, |_h| {});

        let wakeups_clone = Arc::clone(&wakeups);
        let a_for_waiter = Arc::clone(&a);
        let b_for_waiter = Arc::clone(&b);
        let c_for_waiter = Arc::clone(&c);
        let waiter = Task::new(&scheduler, move |h| {
            h.wait_any(&[a_for_waiter, b_for_waiter, c_for_waiter]);
            wakeups_clone.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.schedule_task(Arc::clone(&waiter));
        scheduler.schedule_task(Arc::clone(&a));
        scheduler.schedule_task(Arc::clone(&b));
        scheduler.schedule_task(Arc::clone(&c));
        scheduler.wait_idle();

        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
        assert!(waiter.done());

        // Whichever of a/b/c finished first woke the waiter and cleared the
        // notifier on the other two; none should still have one registered.
        assert!(!a.notify_is_set());
        assert!(!b.notify_is_set());
        assert!(!c.notify_is_set());
    }

    struct MockAdapter {
        callbacks: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl MockAdapter {
        fn fire_all(&self) {
            let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
            for cb in callbacks {
                cb();
            }
        }
    }

    impl DeviceAdapter for MockAdapter {
        fn device_count(&self) -> usize {
            1
        }
        fn init(&self, _device_index: u32) -> DeviceHandle {
            DeviceHandle(0)
        }
        fn deinit(&self, _handle: &DeviceHandle) {}
        fn synchronize(&self, _handle: &DeviceHandle) {}
        fn get_workspace(&self, _handle: &DeviceHandle, _size: usize) -> *mut u8 {
            std::ptr::null_mut()
        }
        fn drain(&self, _handle: &DeviceHandle) {}
        fn emit_signal(&self, _handle: &DeviceHandle, _signal: &Signal) {}
        fn wait_signal(&self, _handle: &DeviceHandle, _signal: &Signal) {}
        fn task_synchronize(&self, _handle: &DeviceHandle, on_complete: Box<dyn FnOnce() + Send>) {
            self.callbacks.lock().unwrap().push(on_complete);
        }
    }

    #[test]
    fn task_synchronize_suspends_until_device_completes() {
        use crate::context::StreamContext;

        let adapter = Arc::new(MockAdapter {
            callbacks: StdMutex::new(Vec::new()),
        });
        let ctx = StreamContext::new_gpu(adapter.clone(), 0);
        let scheduler = ctx.scheduler();

        let ran_to_completion = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran_to_completion);
        let task = Task::new(&scheduler, move |h| {
            h.synchronize(Some(&ctx));
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.schedule_task(task);
        // The task suspended waiting on the device; nothing ran past `synchronize` yet.
        assert_eq!(ran_to_completion.load(Ordering::SeqCst), 0);

        adapter.fire_all();
        scheduler.wait_idle();
        assert_eq!(ran_to_completion.load(Ordering::SeqCst), 1);
    }
}
