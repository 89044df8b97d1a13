// Device buffer pool: caching allocator for GPU storage buffers
//
// Creating a wgpu buffer is a driver round trip. Released buffers are kept
// in per-size free lists (keyed by byte size) and handed to the next
// allocation of the same size instead. Contents of a recycled buffer are
// unspecified; every kernel writes its whole output.
//
//   let buf = pool.alloc(&device, 4096);
//   pool.reclaim(buf);
//   pool.empty_cache();

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use wgpu::{Buffer, BufferDescriptor, BufferUsages, Device};

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes held in the cache (not in use by tensors).
    pub cached_bytes: u64,
    /// Buffers held in the cache.
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that created a new buffer.
    pub misses: u64,
}

/// A caching allocator for storage buffers of one wgpu device.
pub struct BufferPool {
    free: Mutex<HashMap<u64, Vec<Buffer>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            free: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A storage buffer of exactly `size` bytes.
    pub fn alloc(&self, device: &Device, size: u64) -> Buffer {
        if let Some(buf) = self.free.lock().get_mut(&size).and_then(Vec::pop) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        device.create_buffer(&BufferDescriptor {
            label: Some("marten_storage"),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    pub fn reclaim(&self, buffer: Buffer) {
        let size = buffer.size();
        self.free.lock().entry(size).or_default().push(buffer);
    }

    /// Drop every cached buffer.
    pub fn empty_cache(&self) {
        let freed: Vec<Buffer> = self.free.lock().drain().flat_map(|(_, v)| v).collect();
        let bytes: u64 = freed.iter().map(Buffer::size).sum();
        tracing::debug!(buffers = freed.len(), bytes, "gpu pool emptied");
        for buf in freed {
            buf.destroy();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.lock();
        let (cached_buffers, cached_bytes) = free
            .iter()
            .fold((0, 0), |(c, b), (size, v)| (c + v.len(), b + size * v.len() as u64));
        PoolStats {
            cached_bytes,
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
