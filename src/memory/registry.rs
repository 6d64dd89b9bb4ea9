use super::error::PoolError;
use super::pool::{MIN_BATCH_COUNT, NODE_ALIGN, Pool, PoolConfig};
use super::stats::{RegistryStats, TeardownReport};
use super::system::{SystemAlloc, SystemHeap};
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use tracing::debug;

/// Key selecting a pool: the unit size the caller allocates in. Callers must
/// free with the same key they allocated with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(pub u32);

impl From<u32> for SizeClass {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for `Registry`.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Batch count for pools created by `Registry::alloc`. Default: 1.
    pub default_batch_count: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_batch_count: MIN_BATCH_COUNT,
        }
    }
}

/// Owns one `Pool` per size class, created by the first successful
/// allocation under its key and kept until teardown.
pub struct Registry<A: SystemAlloc + Clone = SystemHeap> {
    alloc: A,
    config: RegistryConfig,
    pools: BTreeMap<SizeClass, Pool<A>>,
    /// Batch counts set by `configure_batch` for keys with no pool yet.
    pending: BTreeMap<SizeClass, usize>,
}

impl Default for Registry<SystemHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry<SystemHeap> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_allocator(config, SystemHeap)
    }
}

impl<A: SystemAlloc + Clone> Registry<A> {
    /// Create a registry whose pools all draw from clones of `alloc`.
    pub fn with_allocator(config: RegistryConfig, alloc: A) -> Self {
        Self {
            alloc,
            config,
            pools: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Set the batch count the pool for `key` will be created with.
    ///
    /// Does not create the pool: `key` stays unknown to `free` until an
    /// allocation under it succeeds. Has no effect once the pool exists;
    /// returns whether the count was applied.
    pub fn configure_batch(&mut self, key: SizeClass, batch_count: usize) -> bool {
        if let Some(pool) = self.pools.get_mut(&key) {
            return pool.configure(batch_count);
        }
        self.pending.insert(key, batch_count.max(MIN_BATCH_COUNT));
        true
    }

    /// Allocate `size` bytes from the pool for `key`. A new pool gets the
    /// configured default batch count.
    ///
    /// # Errors
    ///
    /// See `Pool::alloc`.
    pub fn alloc(&mut self, key: SizeClass, size: usize) -> Result<NonNull<u8>, PoolError> {
        let batch_count = self.config.default_batch_count;
        self.alloc_with_batch(key, size, batch_count)
    }

    /// Allocate `size` bytes from the pool for `key`, creating the pool with
    /// `batch_count` if it does not exist yet. A count set by
    /// `configure_batch` takes precedence. An existing pool keeps its own
    /// batch count.
    ///
    /// The pool is registered only once its first allocation succeeds, so a
    /// failed first call leaves `key` unknown and free to retry.
    ///
    /// # Errors
    ///
    /// See `Pool::alloc`.
    pub fn alloc_with_batch(
        &mut self,
        key: SizeClass,
        size: usize,
        batch_count: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        if let Some(pool) = self.pools.get_mut(&key) {
            return pool.alloc(size);
        }

        let batch_count = self.pending.get(&key).copied().unwrap_or(batch_count);
        let mut pool = Pool::with_allocator(PoolConfig { batch_count }, self.alloc.clone());
        let ptr = pool.alloc(size)?;
        debug!(size_class = %key, batch_count = pool.batch_count(), "creating pool");
        self.pending.remove(&key);
        self.pools.insert(key, pool);
        Ok(ptr)
    }

    /// Return `ptr` to the pool for `key`.
    ///
    /// # Safety
    /// If a pool exists for `key`:
    /// - `ptr` must have been returned by an allocation under `key` on this
    ///   registry.
    /// - `ptr` must not have been freed already, nor be used afterwards.
    ///
    /// With no pool for `key` the pointer is never dereferenced.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownSizeClass` without touching any pool if
    /// nothing was ever allocated under `key`.
    ///
    /// # Panics
    ///
    /// With debug assertions, see `Pool::free`.
    pub unsafe fn free(&mut self, key: SizeClass, ptr: NonNull<u8>) -> Result<(), PoolError> {
        let Some(pool) = self.pools.get_mut(&key) else {
            debug!(size_class = %key, ptr = ?ptr, "free for unknown size class");
            return Err(PoolError::UnknownSizeClass(key));
        };
        // Safety: upheld by caller.
        unsafe { pool.free(ptr) };
        Ok(())
    }

    /// Allocate room for `count` values of `T` under `key`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnsupportedAlignment` if `T` needs more than
    /// `NODE_ALIGN`, `PoolError::CapacityOverflow` if the byte size
    /// overflows, otherwise see `Pool::alloc`.
    pub fn alloc_array<T>(&mut self, key: SizeClass, count: usize) -> Result<NonNull<T>, PoolError> {
        let align = std::mem::align_of::<T>();
        if align > NODE_ALIGN {
            return Err(PoolError::UnsupportedAlignment { align });
        }
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(PoolError::CapacityOverflow)?;
        self.alloc(key, bytes).map(NonNull::cast)
    }

    /// Free an array allocated by `alloc_array`.
    ///
    /// # Safety
    /// Same as `Self::free`. Values in the array are not dropped.
    ///
    /// # Errors
    ///
    /// See `Self::free`.
    pub unsafe fn free_array<T>(&mut self, key: SizeClass, ptr: NonNull<T>) -> Result<(), PoolError> {
        // Safety: upheld by caller.
        unsafe { self.free(key, ptr.cast()) }
    }

    #[must_use]
    pub fn contains(&self, key: SizeClass) -> bool {
        self.pools.contains_key(&key)
    }

    #[must_use]
    pub fn pool(&self, key: SizeClass) -> Option<&Pool<A>> {
        self.pools.get(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Registered size classes in ascending order.
    pub fn size_classes(&self) -> impl Iterator<Item = SizeClass> + '_ {
        self.pools.keys().copied()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for pool in self.pools.values() {
            stats.accumulate(&pool.stats());
        }
        stats
    }

    /// Destroy every pool, releasing all of their system allocations.
    /// Pointers handed out by this registry are dangling afterwards.
    pub fn teardown(mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for (_, mut pool) in std::mem::take(&mut self.pools) {
            report.merge(pool.release_all());
        }
        debug!(
            pools = report.pools,
            blocks = report.released_blocks,
            bytes = report.released_bytes,
            outstanding = report.outstanding_slots,
            "registry torn down"
        );
        report
    }
}
