use core::sync::atomic::{AtomicU64, Ordering};

/// Work dispatched during one run, counted from every engine thread.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    matmuls: AtomicU64,
    vector_stages: AtomicU64,
    cache_writes: AtomicU64,
    weight_preloads: AtomicU64,
    waves: AtomicU64,
}

/// Counters frozen at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DispatchSnapshot {
    /// Matrix multiplication tiles dispatched to matrix engines.
    pub matmuls: u64,
    /// Stages run by vector engines.
    pub vector_stages: u64,
    /// Rows written into paged caches.
    pub cache_writes: u64,
    /// Weight tiles loaded ahead of their use.
    pub weight_preloads: u64,
    /// Waves started, summed over engines.
    pub waves: u64,
}

impl DispatchCounters {
    /// One matrix multiplication dispatch.
    pub fn matmul(&self) {
        self.matmuls.fetch_add(1, Ordering::Relaxed);
    }

    /// One vector stage.
    pub fn vector_stage(&self) {
        self.vector_stages.fetch_add(1, Ordering::Relaxed);
    }

    /// `rows` rows written into a cache.
    pub fn cache_write(&self, rows: u64) {
        self.cache_writes.fetch_add(rows, Ordering::Relaxed);
    }

    /// One weight preload.
    pub fn weight_preload(&self) {
        self.weight_preloads.fetch_add(1, Ordering::Relaxed);
    }

    /// One wave started by one engine.
    pub fn wave(&self) {
        self.waves.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            matmuls: self.matmuls.load(Ordering::Acquire),
            vector_stages: self.vector_stages.load(Ordering::Acquire),
            cache_writes: self.cache_writes.load(Ordering::Acquire),
            weight_preloads: self.weight_preloads.load(Ordering::Acquire),
            waves: self.waves.load(Ordering::Acquire),
        }
    }
}
