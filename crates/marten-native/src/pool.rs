// Host memory pool: caching allocator for native tensor buffers
//
// Released buffers are not returned to the system allocator. They are kept
// in per-length free lists and handed out again to the next allocation of
// the same element count. A forward pass allocates the same intermediate
// shapes on every call, so after the first pass almost every allocation is
// a cache hit.
//
// Usage (through NativeDevice helpers):
//
//   let buf = device.alloc(1024);     // from pool, contents unspecified
//   device.reclaim(buf);              // return
//   let stats = device.pool_stats();  // query
//   device.empty_cache();             // hand everything back to the OS

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes currently held in the cache (not in use by tensors).
    pub cached_bytes: usize,
    /// Number of individual buffers currently in the cache.
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that fell through to the system allocator.
    pub misses: u64,
}

/// Maps element count to a stack of free buffers.
struct FreeList {
    buckets: Mutex<HashMap<usize, Vec<Vec<f32>>>>,
}

impl FreeList {
    fn new() -> Self {
        FreeList {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Vec<Vec<f32>>>> {
        // A panic while holding the lock cannot leave a bucket half-written.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_pop(&self, n: usize) -> Option<Vec<f32>> {
        self.lock().get_mut(&n).and_then(|stack| stack.pop())
    }

    fn push(&self, buf: Vec<f32>) {
        let n = buf.len();
        self.lock().entry(n).or_default().push(buf);
    }

    /// Drop every cached buffer, returning (buffers, elements) freed.
    fn drain(&self) -> (usize, usize) {
        let mut count = 0usize;
        let mut elems = 0usize;
        for (n, stack) in self.lock().drain() {
            count += stack.len();
            elems += n * stack.len();
        }
        (count, elems)
    }

    fn stats(&self) -> (usize, usize) {
        let map = self.lock();
        map.iter()
            .fold((0, 0), |(c, e), (n, stack)| (c + stack.len(), e + n * stack.len()))
    }
}

/// A caching allocator for f32 host buffers.
pub struct HostPool {
    free: FreeList,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HostPool {
    pub fn new() -> Self {
        HostPool {
            free: FreeList::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A buffer of exactly `n` elements. Contents are unspecified when the
    /// buffer comes from the cache.
    pub fn alloc(&self, n: usize) -> Vec<f32> {
        if let Some(buf) = self.free.try_pop(n) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            vec![0.0; n]
        }
    }

    /// A buffer of `n` elements all set to `value`.
    pub fn alloc_filled(&self, n: usize, value: f32) -> Vec<f32> {
        let mut buf = self.alloc(n);
        buf.fill(value);
        buf
    }

    /// Return a buffer for reuse.
    pub fn reclaim(&self, buf: Vec<f32>) {
        if buf.is_empty() {
            return;
        }
        self.free.push(buf);
    }

    /// Free every cached buffer.
    pub fn empty_cache(&self) {
        let (count, elems) = self.free.drain();
        tracing::debug!(
            buffers = count,
            bytes = elems * std::mem::size_of::<f32>(),
            "host pool emptied"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let (cached_buffers, elems) = self.free.stats();
        PoolStats {
            cached_bytes: elems * std::mem::size_of::<f32>(),
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Reset hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for HostPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_same_size() {
        let pool = HostPool::new();
        let a = pool.alloc(16);
        pool.reclaim(a);
        let stats = pool.stats();
        assert_eq!(stats.cached_buffers, 1);
        assert_eq!(stats.cached_bytes, 64);

        let b = pool.alloc(16);
        assert_eq!(b.len(), 16);
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached_buffers, 0);
    }

    #[test]
    fn test_different_size_misses() {
        let pool = HostPool::new();
        pool.reclaim(pool.alloc(8));
        let _ = pool.alloc(9);
        assert_eq!(pool.stats().misses, 2);
        pool.empty_cache();
        assert_eq!(pool.stats().cached_buffers, 0);
    }

    #[test]
    fn test_filled_overwrites_stale_data() {
        let pool = HostPool::new();
        pool.reclaim(vec![7.0; 4]);
        assert_eq!(pool.alloc_filled(4, 1.0), vec![1.0; 4]);
    }
}
