pub(crate) mod error;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod stats;
pub(crate) mod system;
#[cfg(test)]
pub(crate) mod testing;
