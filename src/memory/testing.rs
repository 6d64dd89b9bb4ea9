//! Test-only `SystemAlloc` implementations.

use super::error::PoolError;
use super::system::{SystemAlloc, SystemHeap};
use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

/// Forwards to the process heap and counts calls. Clones share counters.
#[derive(Clone, Default)]
pub(crate) struct CountingAlloc {
    allocations: Rc<Cell<usize>>,
    releases: Rc<Cell<usize>>,
    released_bytes: Rc<Cell<usize>>,
}

impl CountingAlloc {
    pub(crate) fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.get()
    }

    pub(crate) fn released_bytes(&self) -> usize {
        self.released_bytes.get()
    }
}

impl SystemAlloc for CountingAlloc {
    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
        // Safety: forwarded caller contract.
        let ptr = unsafe { SystemHeap.allocate(layout)? };
        self.allocations.set(self.allocations.get() + 1);
        Ok(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.releases.set(self.releases.get() + 1);
        self.released_bytes
            .set(self.released_bytes.get() + layout.size());
        // Safety: forwarded caller contract.
        unsafe { SystemHeap.release(ptr, layout) };
    }
}

/// Fails every allocation after `budget` successful ones.
#[derive(Clone)]
pub(crate) struct FailingAlloc {
    budget: Rc<Cell<usize>>,
    inner: CountingAlloc,
}

impl FailingAlloc {
    pub(crate) fn after(budget: usize) -> Self {
        Self {
            budget: Rc::new(Cell::new(budget)),
            inner: CountingAlloc::default(),
        }
    }

    pub(crate) fn counts(&self) -> &CountingAlloc {
        &self.inner
    }
}

impl SystemAlloc for FailingAlloc {
    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
        let left = self.budget.get();
        if left == 0 {
            return Err(PoolError::OutOfMemory {
                size: layout.size(),
            });
        }
        self.budget.set(left - 1);
        // Safety: forwarded caller contract.
        unsafe { self.inner.allocate(layout) }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: forwarded caller contract.
        unsafe { self.inner.release(ptr, layout) };
    }
}
