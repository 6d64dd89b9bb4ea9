//! Point-in-time snapshots of pool and registry state.
//!
//! Counters are plain fields maintained under `&mut self`; a snapshot is
//! exact at the moment it is taken.

/// Snapshot of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes between consecutive nodes. 0 until the first expansion.
    pub slot_size: usize,
    /// Nodes carved per expansion.
    pub batch_count: usize,
    /// System allocations made so far.
    pub expansions: usize,
    /// Nodes carved across all expansions.
    pub capacity: usize,
    /// Nodes currently on the free list.
    pub free_slots: usize,
    /// Nodes currently checked out.
    pub live_slots: usize,
    /// Bytes held from the system allocator.
    pub reserved_bytes: usize,
}

/// Aggregate over every pool in a registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pools: usize,
    pub expansions: usize,
    pub capacity: usize,
    pub live_slots: usize,
    pub reserved_bytes: usize,
}

impl RegistryStats {
    pub(crate) fn accumulate(&mut self, pool: &PoolStats) {
        self.pools += 1;
        self.expansions += pool.expansions;
        self.capacity += pool.capacity;
        self.live_slots += pool.live_slots;
        self.reserved_bytes += pool.reserved_bytes;
    }
}

/// What a teardown gave back to the system allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Pools destroyed.
    pub pools: usize,
    /// System allocations released, one per expansion.
    pub released_blocks: usize,
    pub released_bytes: usize,
    /// Nodes still checked out when their block was released.
    pub outstanding_slots: usize,
}

impl TeardownReport {
    pub(crate) fn merge(&mut self, other: TeardownReport) {
        self.pools += other.pools;
        self.released_blocks += other.released_blocks;
        self.released_bytes += other.released_bytes;
        self.outstanding_slots += other.outstanding_slots;
    }
}
