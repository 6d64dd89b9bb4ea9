use super::registry::SizeClass;
use thiserror::Error;

/// Failures surfaced by pools and the registry.
///
/// Misuse of a pointer (wrong pool, double free) is not represented here: it is
/// a precondition of the `unsafe` free functions and is only detected in debug
/// builds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The system allocator could not provide a block for an expansion.
    #[error("out of memory: system allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    /// `free` was called with a size class that never allocated.
    #[error("no pool registered for size class {0}")]
    UnknownSizeClass(SizeClass),

    /// The request does not fit the slot size fixed by the pool's first expansion.
    #[error("request of {requested} bytes exceeds slot size {slot_size}")]
    SlotTooSmall { requested: usize, slot_size: usize },

    /// Batch or stride arithmetic overflowed, or produced an invalid layout.
    #[error("pool capacity overflow")]
    CapacityOverflow,

    /// Typed allocation for a type that needs more than `NODE_ALIGN` alignment.
    #[error("alignment {align} exceeds the pool node alignment")]
    UnsupportedAlignment { align: usize },
}
