//! The seam between a stream context and a concrete device backend.
//!
//! No adapter ships here (spec: device-specific adapters are out of scope); the CPU
//! path never touches this trait at all. Tests exercise it with a mock.

use crate::signal::Signal;

/// Opaque per-device handle returned by [`DeviceAdapter::init`].
///
/// The adapter alone knows what the wrapped value means (a CUDA device ordinal, a
/// stream pointer, ...); `stream` only ever passes it back to the same adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(pub u64);

/// A device backend a GPU-variant [`crate::context::StreamContext`] delegates to.
///
/// A trait object rather than a raw function-pointer table, so it composes
/// with the rest of the scheduler without an unsafe FFI boundary.
pub trait DeviceAdapter: Send + Sync {
    fn device_count(&self) -> usize;

    fn init(&self, device_index: u32) -> DeviceHandle;

    fn deinit(&self, handle: &DeviceHandle);

    /// Block the calling thread until all work queued on `handle` has completed.
    fn synchronize(&self, handle: &DeviceHandle);

    fn get_workspace(&self, handle: &DeviceHandle, size: usize) -> *mut u8;

    /// Release the device-side workspace buffer back to the adapter.
    fn drain(&self, handle: &DeviceHandle);

    fn emit_signal(&self, handle: &DeviceHandle, signal: &Signal);

    fn wait_signal(&self, handle: &DeviceHandle, signal: &Signal);

    /// Arrange for `on_complete` to run, on some thread, once all work currently
    /// queued on `handle` has finished. Non-blocking: returns immediately.
    fn task_synchronize(&self, handle: &DeviceHandle, on_complete: Box<dyn FnOnce() + Send>);
}
