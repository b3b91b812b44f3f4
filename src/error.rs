use thiserror::Error;

/// Failures surfaced by collector entry points.
///
/// There is no internal recovery beyond the single collect-and-retry the
/// allocation paths perform; every error reaches the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GcError {
    /// The raw allocator reported exhaustion even after a full collection.
    #[error("allocator exhausted after collection")]
    OutOfMemory,
    /// The address is not managed by this collector.
    #[error("pointer is not managed by this collector")]
    UnknownPointer,
}
