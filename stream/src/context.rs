//! Stream contexts: the CPU or device ordering domain tasks and signals live on.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::trace;

use crate::device::{DeviceAdapter, DeviceHandle};
use crate::scheduler::Scheduler;
use crate::signal::{Kind, Signal};

/// The only memory kind a context's own workspace buffer (as opposed to a device
/// adapter's) ever hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Cpu,
}

/// Minimum alignment the growable CPU workspace buffer is allocated with.
const WORKSPACE_ALIGN: usize = 16;

struct Workspace {
    ptr: Option<NonNull<u8>>,
    size: usize,
    layout: Option<Layout>,
}

// Safety: the buffer is plain heap memory with no thread affinity; access to it
// is synchronized by the `Mutex` wrapping this struct in `StreamContext`.
unsafe impl Send for Workspace {}

impl Workspace {
    const fn empty() -> Self {
        Self {
            ptr: None,
            size: 0,
            layout: None,
        }
    }

    /// Returns a buffer of at least `size` bytes, growing (and releasing the
    /// old buffer) if the current one is too small. A shrinking request reuses
    /// the existing buffer unchanged.
    ///
    /// The returned pointer aliases across calls and carries no synchronization
    /// of its own: concurrent callers requesting a workspace from the same
    /// context will clobber each other, matching the single-owner-per-context
    /// contract this buffer has always had.
    fn get(&mut self, size: usize) -> *mut u8 {
        if let Some(ptr) = self.ptr {
            if self.size >= size {
                return ptr.as_ptr();
            }
        }
        self.release();

        let layout =
            Layout::from_size_align(size.max(1), WORKSPACE_ALIGN).expect("workspace layout overflow");
        // Safety: `layout` has non-zero size and a valid power-of-two alignment.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).expect("workspace allocation failed");
        self.ptr = Some(ptr);
        self.size = size;
        self.layout = Some(layout);
        ptr.as_ptr()
    }

    fn release(&mut self) {
        if let (Some(ptr), Some(layout)) = (self.ptr.take(), self.layout.take()) {
            // Safety: `ptr` was allocated with exactly this `layout` in `get`.
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }
        self.size = 0;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

std::thread_local! {
    static PER_THREAD_CPU_CONTEXT: StreamContext = StreamContext::new_cpu();
}

/// An ordering domain for tasks, signals, and a growable scratch workspace.
///
/// CPU contexts never touch a [`DeviceAdapter`]; GPU contexts delegate
/// workspace management, synchronization, and signaling to one. A context's
/// [`Scheduler`] is created lazily on first use and lives for the context's
/// lifetime.
pub struct StreamContext {
    kind: Kind,
    scheduler: OnceLock<Arc<Scheduler>>,
    workspace: Mutex<Workspace>,
    device: Option<(Arc<dyn DeviceAdapter>, DeviceHandle)>,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("kind", &self.kind)
            .field("has_device", &self.device.is_some())
            .finish()
    }
}

impl StreamContext {
    #[must_use]
    pub fn new_cpu() -> Self {
        Self {
            kind: Kind::Cpu,
            scheduler: OnceLock::new(),
            workspace: Mutex::new(Workspace::empty()),
            device: None,
        }
    }

    #[must_use]
    pub fn new_gpu(adapter: Arc<dyn DeviceAdapter>, device_index: u32) -> Self {
        let handle = adapter.init(device_index);
        Self {
            kind: Kind::Gpu(device_index),
            scheduler: OnceLock::new(),
            workspace: Mutex::new(Workspace::empty()),
            device: Some((adapter, handle)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// A stable identity for this context, suitable as a cache key (e.g. the
    /// dataframe crate's per-stream recycling pool). Two different contexts
    /// never compare equal; the same context always does.
    #[must_use]
    pub fn identity(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    pub(crate) fn device_parts(&self) -> Option<(&Arc<dyn DeviceAdapter>, &DeviceHandle)> {
        self.device.as_ref().map(|(a, h)| (a, h))
    }

    /// Number of devices of `kind`: always 1 for CPU, the adapter's own count
    /// for GPU.
    #[must_use]
    pub fn device_count(kind: Kind, adapter: Option<&dyn DeviceAdapter>) -> usize {
        match kind {
            Kind::Cpu => 1,
            Kind::Gpu(_) => adapter.map_or(0, DeviceAdapter::device_count),
        }
    }

    /// Returns this context's scheduler, constructing it on first call.
    #[must_use]
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(self.scheduler.get_or_init(Scheduler::new))
    }

    fn workspace_impl(&self, size: usize) -> *mut u8 {
        if let Some((adapter, handle)) = &self.device {
            return adapter.get_workspace(handle, size);
        }
        self.workspace.lock().unwrap().get(size)
    }

    fn drain_impl(&self) {
        if let Some((adapter, handle)) = &self.device {
            adapter.drain(handle);
        } else {
            self.workspace.lock().unwrap().release();
        }
    }

    /// Waits for this context's scheduler (if any exists yet) to go idle, then,
    /// for a GPU context, synchronizes the underlying device stream.
    pub fn wait(&self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.wait_idle();
        }
        if let Some((adapter, handle)) = &self.device {
            adapter.synchronize(handle);
        }
    }

    pub fn emit_signal(&self, signal: &Signal) {
        if let Some((adapter, handle)) = &self.device {
            adapter.emit_signal(handle, signal);
        }
    }

    pub fn wait_signal(&self, signal: &Signal) {
        if let Some((adapter, handle)) = &self.device {
            adapter.wait_signal(handle, signal);
        }
    }
}

impl Drop for StreamContext {
    fn drop(&mut self) {
        self.workspace.get_mut().unwrap().release();
        if let Some((adapter, handle)) = self.device.take() {
            adapter.deinit(&handle);
        }
        trace!("stream context dropped");
    }
}

/// Returns a scratch workspace of at least `size` bytes for `ctx`, or, for a
/// `None` context, from a process-wide per-thread CPU fallback context.
#[must_use]
pub fn get_workspace(ctx: Option<&StreamContext>, size: usize, kind: MemoryKind) -> *mut u8 {
    let MemoryKind::Cpu = kind;
    match ctx {
        Some(ctx) => ctx.workspace_impl(size),
        None => PER_THREAD_CPU_CONTEXT.with(|fallback| fallback.workspace_impl(size)),
    }
}

/// Releases `ctx`'s workspace buffer (or the device's, for a GPU context) back
/// to the allocator. A `None` context drains the per-thread CPU fallback.
pub fn drain(ctx: Option<&StreamContext>) {
    match ctx {
        Some(ctx) => ctx.drain_impl(),
        None => PER_THREAD_CPU_CONTEXT.with(StreamContext::drain_impl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_workspace_grows_and_reuses() {
        let ctx = StreamContext::new_cpu();
        let p1 = get_workspace(Some(&ctx), 64, MemoryKind::Cpu);
        let p2 = get_workspace(Some(&ctx), 32, MemoryKind::Cpu);
        assert_eq!(p1, p2, "shrinking request reuses the same buffer");

        let p3 = get_workspace(Some(&ctx), 4096, MemoryKind::Cpu);
        assert_ne!(p1, p3, "growing request allocates a fresh buffer");
    }

    #[test]
    fn null_context_uses_per_thread_fallback() {
        let p1 = get_workspace(None, 16, MemoryKind::Cpu);
        let p2 = get_workspace(None, 8, MemoryKind::Cpu);
        assert_eq!(p1, p2);
        drain(None);
    }

    #[test]
    fn cpu_context_has_lazily_created_scheduler() {
        let ctx = StreamContext::new_cpu();
        let a = ctx.scheduler();
        let b = ctx.scheduler();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
