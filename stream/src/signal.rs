//! Stream ordering domains and the one-shot tokens used to synchronize them.

/// The kind of device a [`crate::context::StreamContext`] or [`Signal`] targets.
///
/// A plain enum rather than a packed type-word-plus-index bitfield, since Rust
/// doesn't need the packing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Cpu,
    Gpu(u32),
}

/// A one-shot synchronization token targetable at a stream domain.
///
/// CPU signals are reserved no-ops. Device signals are emitted on one stream and
/// waited on by another, via the registered [`crate::device::DeviceAdapter`].
#[derive(Debug)]
pub struct Signal {
    kind: Kind,
}

impl Signal {
    #[must_use]
    pub fn new(kind: Kind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }
}
