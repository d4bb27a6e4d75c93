//! Opaque stream-context identity, used only as a pool cache key.
//!
//! This crate has no dependency on the `stream` crate: it doesn't know what a
//! stream context *is*, only that two of them are either the same one or not.
//! Callers that also use `stream` construct the identity from
//! `StreamContext::identity()`.

/// A stable identity for a stream context (or the absence of one).
///
/// Equality is by identity, not content — the same underlying context always
/// maps to the same `StreamCtxId`, and no two distinct contexts ever collide
/// (barring address reuse after a context is freed, which the `stream` crate's
/// scheduler lifetime rules are expected to avoid across overlapping use).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamCtxId(usize);

impl StreamCtxId {
    /// The identity used for "no stream context" (the default/CPU case).
    pub const NONE: StreamCtxId = StreamCtxId(0);

    /// Builds an identity from a raw pointer value, e.g. a stream context's
    /// own address. `NONE` is reserved, so a real pointer aliasing it (only
    /// possible for a null pointer) collapses to `NONE` too, which is correct:
    /// null means "no context" either way.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        StreamCtxId(ptr as usize)
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}
