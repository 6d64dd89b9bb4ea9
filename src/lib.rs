//! Size-class keyed pooled allocation.
//!
//! A [`Registry`] maps each [`SizeClass`] to its own [`Pool`]. A pool carves
//! one system allocation into a batch of equally sized, 16-byte aligned nodes
//! and recycles them through an intrusive LIFO free list, so a recurring
//! buffer shape costs one system allocation per batch instead of one per
//! request.

pub mod memory;

// pools
pub use memory::pool::{MIN_BATCH_COUNT, NODE_ALIGN, Pool, PoolConfig};
pub use memory::registry::{Registry, RegistryConfig, SizeClass};

// system allocator seam
pub use memory::system::{SystemAlloc, SystemHeap};

// stats
pub use memory::stats::{PoolStats, RegistryStats, TeardownReport};

// errors
pub use memory::error::PoolError;
