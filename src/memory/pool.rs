use super::error::PoolError;
use super::stats::{PoolStats, TeardownReport};
use super::system::{SystemAlloc, SystemHeap};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::alloc::Layout;
use std::ptr::NonNull;
use tracing::{debug, trace};

/// Alignment of every node handed out by a pool.
pub const NODE_ALIGN: usize = 16;

/// Batch count used when none (or zero) is configured: one node per system
/// allocation.
pub const MIN_BATCH_COUNT: usize = 1;

/// Bytes of a free node used for the free-list link.
const LINK_SIZE: usize = std::mem::size_of::<*mut u8>();

/// 32-bit canary written right after the link of every free node.
/// Checked on alloc to detect writes through a freed pointer.
/// Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
const FREE_CANARY: u32 = 0xAB_AD_BA_BE;

/// Configuration for `Pool`.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Nodes carved out of each system allocation. Default: 1.
    pub batch_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            batch_count: MIN_BATCH_COUNT,
        }
    }
}

/// One system allocation, carved into `slots` nodes.
struct Block {
    base: NonNull<u8>,
    layout: Layout,
    slots: usize,
}

/// Intrusive LIFO of free nodes. While a node is on the list its first
/// `LINK_SIZE` bytes hold the pointer to the next node.
struct FreeList {
    head: Option<NonNull<u8>>,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// # Safety
    /// `node` must be valid for `LINK_SIZE` bytes, aligned for a pointer, and
    /// not referenced by anyone else while listed.
    unsafe fn push(&mut self, node: NonNull<u8>) {
        let next = self.head.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        // Safety: upheld by caller.
        unsafe { node.cast::<*mut u8>().write(next) };
        self.head = Some(node);
        self.len += 1;
    }

    /// # Safety
    /// Every listed node must still be valid (see `push`).
    unsafe fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // Safety: node was linked by `push`.
        let next = unsafe { node.cast::<*mut u8>().read() };
        self.head = NonNull::new(next);
        self.len -= 1;
        Some(node)
    }

    fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }
}

/// Fixed-size node allocator for one size class.
///
/// Each expansion makes a single system allocation large enough for
/// `batch_count` nodes and pushes all of them onto the free list. Nodes are
/// handed out and taken back in LIFO order. Every system allocation is
/// recorded in a side table, so teardown releases each one exactly once
/// whether or not its nodes are still checked out.
pub struct Pool<A: SystemAlloc = SystemHeap> {
    alloc: A,
    batch_count: usize,
    /// Distance between nodes, fixed by the first expansion. 0 before that.
    slot_size: usize,
    free: FreeList,
    blocks: Vec<Block>,
    live_count: usize,
    /// Tracks which slots are currently checked out
    #[cfg(debug_assertions)]
    live_mask: FixedBitSet,
}

// Safety: Pool owns its blocks; nothing else aliases them.
unsafe impl<A: SystemAlloc + Send> Send for Pool<A> {}

impl Default for Pool<SystemHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool<SystemHeap> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_allocator(config, SystemHeap)
    }
}

impl<A: SystemAlloc> Pool<A> {
    /// Create a pool that draws its blocks from `alloc`.
    pub fn with_allocator(config: PoolConfig, alloc: A) -> Self {
        Self {
            alloc,
            batch_count: config.batch_count.max(MIN_BATCH_COUNT),
            slot_size: 0,
            free: FreeList::new(),
            blocks: Vec::new(),
            live_count: 0,
            #[cfg(debug_assertions)]
            live_mask: FixedBitSet::new(),
        }
    }

    /// Set the number of nodes carved per expansion. 0 means 1.
    ///
    /// Only takes effect before the first expansion; returns whether it did.
    pub fn configure(&mut self, batch_count: usize) -> bool {
        if !self.blocks.is_empty() {
            debug!(
                batch_count,
                current = self.batch_count,
                "pool already expanded, batch count unchanged"
            );
            return false;
        }
        self.batch_count = batch_count.max(MIN_BATCH_COUNT);
        true
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Node stride, or 0 if the pool has not expanded yet.
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Hand out a node of at least `size` bytes, aligned to `NODE_ALIGN`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::OutOfMemory` if an expansion was needed and the
    /// system allocator failed, `PoolError::SlotTooSmall` if `size` exceeds
    /// the slot size fixed by the first expansion.
    ///
    /// # Panics
    ///
    /// Panics if the node about to be handed out was written after it was
    /// freed (debug builds only).
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        if self.slot_size != 0 && size > self.slot_size {
            return Err(PoolError::SlotTooSmall {
                requested: size,
                slot_size: self.slot_size,
            });
        }
        if self.free.is_empty() {
            self.expand(size)?;
        }

        // Safety: every listed node lies inside one of our live blocks.
        let node = unsafe { self.free.pop() }.ok_or(PoolError::OutOfMemory { size })?;

        #[cfg(debug_assertions)]
        self.debug_check_alloc(node);

        self.live_count += 1;
        trace!(ptr = ?node, size, "pool alloc");
        Ok(node)
    }

    /// Return a node to the head of the free list.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `Self::alloc` on this exact pool.
    /// - `ptr` must not have been freed already.
    /// - `ptr` must not be used after this call.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a node of this pool or is already free (debug
    /// builds only).
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        #[cfg(debug_assertions)]
        self.debug_check_free(ptr);

        // Safety: ptr is one of our nodes (caller contract), so it spans at
        // least `slot_size >= NODE_ALIGN` bytes and is NODE_ALIGN-aligned.
        unsafe {
            #[cfg(debug_assertions)]
            Self::write_canary(ptr, FREE_CANARY);
            self.free.push(ptr);
        }
        self.live_count = self.live_count.saturating_sub(1);
        trace!(ptr = ?ptr, "pool free");
    }

    /// Release every system allocation this pool made and reset it to its
    /// unexpanded state. Nodes still checked out become dangling.
    pub fn release_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport {
            pools: 1,
            outstanding_slots: self.live_count,
            ..TeardownReport::default()
        };

        self.free.clear();
        for block in self.blocks.drain(..) {
            // Safety: block.base came from self.alloc with block.layout and
            // is released exactly once, here.
            unsafe { self.alloc.release(block.base, block.layout) };
            report.released_blocks += 1;
            report.released_bytes += block.layout.size();
        }
        self.slot_size = 0;
        self.live_count = 0;
        #[cfg(debug_assertions)]
        {
            self.live_mask = FixedBitSet::new();
        }

        if report.released_blocks > 0 {
            debug!(
                blocks = report.released_blocks,
                bytes = report.released_bytes,
                outstanding = report.outstanding_slots,
                "pool released"
            );
        }
        report
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slot_size: self.slot_size,
            batch_count: self.batch_count,
            expansions: self.blocks.len(),
            capacity: self.capacity(),
            free_slots: self.free.len,
            live_slots: self.live_count,
            reserved_bytes: self.blocks.iter().map(|b| b.layout.size()).sum(),
        }
    }

    fn capacity(&self) -> usize {
        self.blocks.iter().map(|b| b.slots).sum()
    }

    /// Node stride for a request: room for the link, rounded up to `NODE_ALIGN`.
    fn stride_for(size: usize) -> Result<usize, PoolError> {
        size.max(LINK_SIZE)
            .checked_next_multiple_of(NODE_ALIGN)
            .ok_or(PoolError::CapacityOverflow)
    }

    /// Make one system allocation and push `batch_count` fresh nodes. Only
    /// called when the free list is empty.
    fn expand(&mut self, size: usize) -> Result<(), PoolError> {
        let stride = if self.slot_size == 0 {
            Self::stride_for(size)?
        } else {
            self.slot_size
        };
        let batch = self.batch_count;
        let bytes = stride
            .checked_mul(batch)
            .ok_or(PoolError::CapacityOverflow)?;
        let layout =
            Layout::from_size_align(bytes, NODE_ALIGN).map_err(|_| PoolError::CapacityOverflow)?;

        // Safety: bytes >= stride >= NODE_ALIGN, so the layout is non-empty.
        let base = unsafe { self.alloc.allocate(layout)? };
        self.slot_size = stride;

        // Push back to front so the block's first node becomes the head.
        for index in (0..batch).rev() {
            // Safety: index * stride < bytes, inside the block we just got.
            // The block is NODE_ALIGN-aligned and stride is a multiple of it.
            unsafe {
                let node = base.add(index * stride);
                #[cfg(debug_assertions)]
                Self::write_canary(node, FREE_CANARY);
                self.free.push(node);
            }
        }
        self.blocks.push(Block {
            base,
            layout,
            slots: batch,
        });

        #[cfg(debug_assertions)]
        {
            let capacity = self.capacity();
            self.live_mask.grow(capacity);
        }

        debug!(
            slot_size = stride,
            batch,
            bytes,
            expansions = self.blocks.len(),
            "pool expanded"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Debug validation
    // ------------------------------------------------------------------------

    /// # Safety
    /// `node` must be a node of this pool.
    #[cfg(debug_assertions)]
    unsafe fn write_canary(node: NonNull<u8>, value: u32) {
        // Safety: slot_size >= NODE_ALIGN >= LINK_SIZE + 4 and the offset is
        // aligned for u32.
        unsafe { node.add(LINK_SIZE).cast::<u32>().write(value) };
    }

    /// Global slot index of `ptr`, or `None` if it is not a node boundary
    /// inside one of our blocks.
    #[cfg(debug_assertions)]
    fn slot_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let mut first = 0;
        for block in &self.blocks {
            let base = block.base.as_ptr() as usize;
            if addr >= base && addr < base + block.layout.size() {
                let offset = addr - base;
                if !offset.is_multiple_of(self.slot_size) {
                    return None;
                }
                return Some(first + offset / self.slot_size);
            }
            first += block.slots;
        }
        None
    }

    #[cfg(debug_assertions)]
    fn debug_check_alloc(&mut self, node: NonNull<u8>) {
        let Some(index) = self.slot_index(node) else {
            panic!("Pool corruption: free list yielded foreign pointer {node:p}");
        };
        // Safety: node is one of our slots (checked above).
        let canary = unsafe { node.add(LINK_SIZE).cast::<u32>().read() };
        assert!(
            canary == FREE_CANARY,
            "Pool use-after-free detected: free node {node:p} was written (canary 0x{canary:08x})",
        );
        // Safety: as above.
        unsafe { Self::write_canary(node, 0) };
        self.live_mask.insert(index);
    }

    #[cfg(debug_assertions)]
    fn debug_check_free(&mut self, ptr: NonNull<u8>) {
        let Some(index) = self.slot_index(ptr) else {
            panic!("Pointer {ptr:p} does not belong to this pool");
        };
        assert!(
            self.live_mask.contains(index),
            "Double free detected in pool for pointer {ptr:p}",
        );
        self.live_mask.set(index, false);
    }
}

impl<A: SystemAlloc> Drop for Pool<A> {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
