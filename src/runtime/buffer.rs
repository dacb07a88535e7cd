//! Per-worker connection-buffer pools.
//!
//! Read buffers are page-sized and recycled through a per-worker pool so idle
//! connections hold no read memory and busy ones avoid per-request
//! allocation. Each pool reports into a shared stats group so `stats
//! conn_buffer` can show every worker.
//!
//! Exhaustion is non-fatal: `acquire` returns `None` and the caller sends
//! "out of memory" to the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size of each pooled buffer.
pub const CONN_BUFFER_PAGE_SIZE: usize = 16 * 1024;

/// Counters one pool publishes for `stats conn_buffer`.
#[derive(Debug, Default)]
pub struct PoolGroupStats {
    pub allocates: AtomicU64,
    pub frees: AtomicU64,
    pub destroys: AtomicU64,
    pub bytes_pooled: AtomicU64,
    pub bytes_outstanding: AtomicU64,
    pub peak_buffer_usage: AtomicU64,
}

/// Shared view of every worker's pool, for the stats command.
pub struct PoolRegistry {
    groups: Vec<Arc<PoolGroupStats>>,
}

impl PoolRegistry {
    pub fn new(num_groups: usize) -> Arc<PoolRegistry> {
        Arc::new(PoolRegistry {
            groups: (0..num_groups)
                .map(|_| Arc::new(PoolGroupStats::default()))
                .collect(),
        })
    }

    pub fn group(&self, idx: usize) -> Arc<PoolGroupStats> {
        Arc::clone(&self.groups[idx])
    }

    /// Render one block of `STAT` lines per group.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (i, g) in self.groups.iter().enumerate() {
            let _ = write!(
                out,
                "STAT group {i} allocates {} frees {} destroys {} \
                 bytes_pooled {} bytes_outstanding {} peak_buffer_usage {}\r\n",
                g.allocates.load(Ordering::Relaxed),
                g.frees.load(Ordering::Relaxed),
                g.destroys.load(Ordering::Relaxed),
                g.bytes_pooled.load(Ordering::Relaxed),
                g.bytes_outstanding.load(Ordering::Relaxed),
                g.peak_buffer_usage.load(Ordering::Relaxed),
            );
        }
        out
    }
}

/// A per-worker pool of page-sized buffers.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    page_size: usize,
    /// Total bytes this pool may hold across pooled and outstanding buffers.
    limit_bytes: usize,
    /// Bytes kept cached in the free list before releases start destroying.
    reserve_bytes: usize,
    outstanding_bytes: usize,
    stats: Arc<PoolGroupStats>,
}

impl BufferPool {
    pub fn new(limit_bytes: usize, stats: Arc<PoolGroupStats>) -> BufferPool {
        BufferPool {
            free: Vec::new(),
            page_size: CONN_BUFFER_PAGE_SIZE,
            limit_bytes,
            reserve_bytes: limit_bytes / 2,
            outstanding_bytes: 0,
            stats,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn pooled_bytes(&self) -> usize {
        self.free.len() * self.page_size
    }

    /// Take a zeroed page-sized buffer, recycled if one is cached.
    pub fn acquire(&mut self) -> Option<Vec<u8>> {
        let buf = match self.free.pop() {
            Some(mut buf) => {
                self.stats
                    .bytes_pooled
                    .fetch_sub(self.page_size as u64, Ordering::Relaxed);
                buf.clear();
                buf.resize(self.page_size, 0);
                buf
            }
            None => {
                if self.outstanding_bytes + self.pooled_bytes() + self.page_size > self.limit_bytes
                {
                    return None;
                }
                vec![0u8; self.page_size]
            }
        };

        self.outstanding_bytes += self.page_size;
        self.stats.allocates.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_outstanding
            .fetch_add(self.page_size as u64, Ordering::Relaxed);
        Some(buf)
    }

    /// Return a buffer, recording how much of it was actually used. Buffers
    /// that grew past the page size, and releases past the pool's reserve,
    /// are destroyed instead of cached.
    pub fn release(&mut self, buf: Vec<u8>, used: usize) {
        self.report_peak(used);
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(self.page_size);
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_outstanding
            .fetch_sub(self.page_size as u64, Ordering::Relaxed);

        if buf.capacity() > self.page_size || self.pooled_bytes() + self.page_size > self.reserve_bytes
        {
            self.stats.destroys.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.free.push(buf);
        self.stats
            .bytes_pooled
            .fetch_add(self.page_size as u64, Ordering::Relaxed);
    }

    /// Record the high-water usage of a buffer still in use.
    pub fn report_peak(&self, used: usize) {
        self.stats
            .peak_buffer_usage
            .fetch_max(used as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(limit: usize) -> BufferPool {
        BufferPool::new(limit, Arc::new(PoolGroupStats::default()))
    }

    #[test]
    fn acquire_release_recycles() {
        let mut pool = pool(CONN_BUFFER_PAGE_SIZE * 8);

        let buf = pool.acquire().unwrap();
        assert_eq!(buf.len(), CONN_BUFFER_PAGE_SIZE);
        pool.release(buf, 100);

        // recycled, not reallocated
        assert_eq!(pool.free.len(), 1);
        let buf = pool.acquire().unwrap();
        assert_eq!(buf.len(), CONN_BUFFER_PAGE_SIZE);
        assert!(pool.free.is_empty());
        pool.release(buf, 0);
    }

    #[test]
    fn limit_bounds_outstanding_buffers() {
        let mut pool = pool(CONN_BUFFER_PAGE_SIZE * 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        pool.release(a, 0);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn grown_buffers_are_destroyed() {
        let mut pool = pool(CONN_BUFFER_PAGE_SIZE * 8);

        let mut buf = pool.acquire().unwrap();
        buf.resize(CONN_BUFFER_PAGE_SIZE * 2, 0);
        pool.release(buf, CONN_BUFFER_PAGE_SIZE * 2);
        assert!(pool.free.is_empty());
        assert_eq!(pool.stats.destroys.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn releases_past_reserve_are_destroyed() {
        // reserve is half the limit: two pages may be cached, not three
        let mut pool = pool(CONN_BUFFER_PAGE_SIZE * 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        pool.release(a, 0);
        pool.release(b, 0);
        pool.release(c, 0);

        assert_eq!(pool.free.len(), 2);
        assert_eq!(pool.stats.destroys.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn registry_renders_a_line_per_group() {
        let registry = PoolRegistry::new(2);
        let mut pool = BufferPool::new(CONN_BUFFER_PAGE_SIZE * 4, registry.group(0));
        let buf = pool.acquire().unwrap();
        pool.release(buf, 42);

        let text = registry.render();
        assert!(text.contains("STAT group 0 allocates 1 frees 1"));
        assert!(text.contains("STAT group 1 allocates 0"));
        assert!(text.contains("peak_buffer_usage 42"));
    }
}
