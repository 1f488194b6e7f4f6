use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of pool counters, suitable for profiling/telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Leases carved out of the ring.
    pub pool_allocations: u64,
    /// Leases that had to jump back to the base of the ring.
    pub wrap_allocations: u64,
    /// Times an allocation blocked waiting for a GPU retirement.
    pub retirement_waits: u64,

    /// Buffers handed to the GPU queue (pool-backed only).
    pub buffers_queued: u64,
    /// Flushes of an untouched buffer, recycled without reaching the GPU.
    pub empty_flushes: u64,
    /// Buffers the GPU has retired back to the pool.
    pub buffers_retired: u64,

    /// One-shot display lists queued.
    pub display_lists_queued: u64,
    /// User display-list sessions opened.
    pub user_sessions: u64,
    /// Display-list growth callbacks invoked.
    pub display_list_growths: u64,

    /// Descriptors minted because the free list was empty.
    pub descriptors_minted: u64,
}

/// Live counters behind [`PoolStats`]. Relaxed ordering throughout; these
/// are telemetry, not synchronization.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub pool_allocations: AtomicU64,
    pub wrap_allocations: AtomicU64,
    pub retirement_waits: AtomicU64,
    pub buffers_queued: AtomicU64,
    pub empty_flushes: AtomicU64,
    pub buffers_retired: AtomicU64,
    pub display_lists_queued: AtomicU64,
    pub user_sessions: AtomicU64,
    pub display_list_growths: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, descriptors_minted: u64) -> PoolStats {
        PoolStats {
            pool_allocations: self.pool_allocations.load(Ordering::Relaxed),
            wrap_allocations: self.wrap_allocations.load(Ordering::Relaxed),
            retirement_waits: self.retirement_waits.load(Ordering::Relaxed),
            buffers_queued: self.buffers_queued.load(Ordering::Relaxed),
            empty_flushes: self.empty_flushes.load(Ordering::Relaxed),
            buffers_retired: self.buffers_retired.load(Ordering::Relaxed),
            display_lists_queued: self.display_lists_queued.load(Ordering::Relaxed),
            user_sessions: self.user_sessions.load(Ordering::Relaxed),
            display_list_growths: self.display_list_growths.load(Ordering::Relaxed),
            descriptors_minted,
        }
    }
}
