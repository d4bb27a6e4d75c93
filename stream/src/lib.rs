//! Stream contexts and a cooperative, M:1 stackful-task scheduler.
//!
//! A [`context::StreamContext`] is an ordering domain (CPU or one GPU device).
//! Work submitted to it runs as a [`task::Task`] — a stackful coroutine built on
//! the `fiber` crate — multiplexed onto at most one worker thread per context by
//! a [`scheduler::Scheduler`]. Tasks suspend cooperatively to wait on device
//! completion ([`task::TaskHandle::synchronize`]) or on each other
//! ([`task::TaskHandle::wait_any`]); they never swap directly to one another,
//! always through the scheduler.

pub mod context;
pub mod device;
pub mod scheduler;
pub mod signal;
pub mod task;

pub use context::{drain, get_workspace, MemoryKind, StreamContext};
pub use device::{DeviceAdapter, DeviceHandle};
pub use scheduler::Scheduler;
pub use signal::{Kind, Signal};
pub use task::{Task, TaskHandle, TASK_STACK_SIZE};
