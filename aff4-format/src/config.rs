use std::time::Duration;

/// Default chunk size of image streams (32 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024;
/// Default number of chunks per bevy.
pub const DEFAULT_CHUNKS_IN_SEGMENT: u64 = 2048;

/// Tunables for a [`Resolver`](crate::Resolver).
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Objects kept in the read-side cache. Eviction is oldest-inserted-first.
    pub read_cache_size: usize,
    /// Objects kept in the write-side cache. Evicted objects are closed.
    pub write_cache_size: usize,
    /// `None` blocks indefinitely on a busy URN.
    pub lock_timeout: Option<Duration>,
    /// Fail with `ConcurrencyHazard` instead of deadlocking when a thread
    /// opens a URN it already holds.
    pub detect_reentrancy: bool,
    /// Bevies compressed concurrently per image writer.
    pub max_bevy_workers: usize,
    /// Decompressed chunks cached per image reader.
    pub chunk_cache_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            read_cache_size: 64,
            write_cache_size: 64,
            lock_timeout: None,
            detect_reentrancy: false,
            max_bevy_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            chunk_cache_size: 256,
        }
    }
}
