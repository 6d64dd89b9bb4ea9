use super::error::PoolError;
use std::alloc::Layout;
use std::ptr::NonNull;

/// The allocator pools draw their blocks from.
///
/// A pool makes exactly one `allocate` call per expansion and exactly one
/// `release` call per block at teardown, always with the layout it allocated
/// with.
pub trait SystemAlloc {
    /// Allocate a zero-filled block for `layout`.
    ///
    /// # Safety
    /// `layout` must have a non-zero size.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::OutOfMemory` if the block cannot be obtained.
    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, PoolError>;

    /// Return a block to the system.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHeap;

#[cfg(all(unix, not(miri)))]
mod unix {
    use super::{Layout, NonNull, PoolError, SystemAlloc, SystemHeap};

    impl SystemAlloc for SystemHeap {
        unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
            let size = layout.size();
            if size == 0 {
                return Err(PoolError::CapacityOverflow);
            }
            // posix_memalign wants a power of two that is a multiple of the pointer size.
            let align = layout.align().max(std::mem::size_of::<*mut libc::c_void>());

            let mut out: *mut libc::c_void = std::ptr::null_mut();
            // Safety: FFI call to posix_memalign, `out` is a valid out pointer.
            let rc = unsafe { libc::posix_memalign(&raw mut out, align, size) };
            if rc != 0 {
                return Err(PoolError::OutOfMemory { size });
            }
            let ptr = NonNull::new(out.cast::<u8>()).ok_or(PoolError::OutOfMemory { size })?;

            // Safety: ptr points to `size` writable bytes we just allocated.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
            Ok(ptr)
        }

        unsafe fn release(&self, ptr: NonNull<u8>, _layout: Layout) {
            // Safety: ptr came from posix_memalign (caller contract).
            unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        }
    }
}

// ---------------------------------------------------------------------------
// Portable path: std::alloc. Also used under Miri, which cannot see through
// the libc allocation calls.
// ---------------------------------------------------------------------------
#[cfg(any(not(unix), miri))]
impl SystemAlloc for SystemHeap {
    unsafe fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, PoolError> {
        if layout.size() == 0 {
            return Err(PoolError::CapacityOverflow);
        }
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(PoolError::OutOfMemory {
            size: layout.size(),
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: ptr was allocated with the same layout via `allocate`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
