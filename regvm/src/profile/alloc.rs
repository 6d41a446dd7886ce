use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

/// Counters for allocations made outside the object heap.
#[derive(Debug, Default)]
struct ExternalCounters {
    alloc_count: AtomicU64,
    alloc_size: AtomicU64,
    failed_alloc_count: AtomicU64,
    failed_alloc_size: AtomicU64,
    free_count: AtomicU64,
    free_size: AtomicU64,
}

/// Allocation profiler state. Used both process wide and per context.
///
/// Increments are plain relaxed adds: the numbers are diagnostic, so the
/// only guarantee is that no update is torn or lost.
#[derive(Debug)]
pub struct AllocProfState {
    enabled: AtomicBool,
    alloc_count: AtomicU64,
    alloc_size: AtomicU64,
    failed_alloc_count: AtomicU64,
    failed_alloc_size: AtomicU64,
    free_count: AtomicU64,
    free_size: AtomicU64,
    gc_count: AtomicU64,
    external: Option<ExternalCounters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalAllocStats {
    pub alloc_count: u64,
    pub alloc_size: u64,
    pub failed_alloc_count: u64,
    pub failed_alloc_size: u64,
    pub free_count: u64,
    pub free_size: u64,
}

/// A point-in-time copy of an [`AllocProfState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub alloc_count: u64,
    pub alloc_size: u64,
    pub failed_alloc_count: u64,
    pub failed_alloc_size: u64,
    pub free_count: u64,
    pub free_size: u64,
    pub gc_count: u64,
    pub external: Option<ExternalAllocStats>,
}

impl AllocProfState {
    pub fn new(track_external: bool) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            alloc_count: AtomicU64::new(0),
            alloc_size: AtomicU64::new(0),
            failed_alloc_count: AtomicU64::new(0),
            failed_alloc_size: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            free_size: AtomicU64::new(0),
            gc_count: AtomicU64::new(0),
            external: track_external.then(ExternalCounters::default),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Acquire)
    }

    pub fn tracks_external(&self) -> bool {
        self.external.is_some()
    }

    /// Zero every counter and begin counting.
    pub fn start(&self) {
        // if you add a counter, zero it here
        for counter in [
            &self.alloc_count,
            &self.alloc_size,
            &self.failed_alloc_count,
            &self.failed_alloc_size,
            &self.free_count,
            &self.free_size,
            &self.gc_count,
        ] {
            counter.store(0, Relaxed);
        }
        if let Some(ext) = &self.external {
            for counter in [
                &ext.alloc_count,
                &ext.alloc_size,
                &ext.failed_alloc_count,
                &ext.failed_alloc_size,
                &ext.free_count,
                &ext.free_size,
            ] {
                counter.store(0, Relaxed);
            }
        }
        self.enabled.store(true, Release);
    }

    /// Stop counting. The counters keep their values.
    pub fn stop(&self) {
        self.enabled.store(false, Release);
    }

    #[inline]
    fn bump(&self, count: &AtomicU64, size: &AtomicU64, bytes: usize) {
        if self.is_enabled() {
            count.fetch_add(1, Relaxed);
            size.fetch_add(bytes as u64, Relaxed);
        }
    }

    pub fn record_alloc(&self, bytes: usize) {
        self.bump(&self.alloc_count, &self.alloc_size, bytes);
    }

    pub fn record_failed_alloc(&self, bytes: usize) {
        self.bump(&self.failed_alloc_count, &self.failed_alloc_size, bytes);
    }

    pub fn record_free(&self, bytes: usize) {
        self.bump(&self.free_count, &self.free_size, bytes);
    }

    pub fn record_gc(&self) {
        if self.is_enabled() {
            self.gc_count.fetch_add(1, Relaxed);
        }
    }

    pub fn record_external_alloc(&self, bytes: usize) {
        if let Some(ext) = &self.external {
            self.bump(&ext.alloc_count, &ext.alloc_size, bytes);
        }
    }

    pub fn record_failed_external_alloc(&self, bytes: usize) {
        if let Some(ext) = &self.external {
            self.bump(&ext.failed_alloc_count, &ext.failed_alloc_size, bytes);
        }
    }

    pub fn record_external_free(&self, bytes: usize) {
        if let Some(ext) = &self.external {
            self.bump(&ext.free_count, &ext.free_size, bytes);
        }
    }

    pub fn snapshot(&self) -> AllocStats {
        AllocStats {
            alloc_count: self.alloc_count.load(Relaxed),
            alloc_size: self.alloc_size.load(Relaxed),
            failed_alloc_count: self.failed_alloc_count.load(Relaxed),
            failed_alloc_size: self.failed_alloc_size.load(Relaxed),
            free_count: self.free_count.load(Relaxed),
            free_size: self.free_size.load(Relaxed),
            gc_count: self.gc_count.load(Relaxed),
            external: self.external.as_ref().map(|ext| ExternalAllocStats {
                alloc_count: ext.alloc_count.load(Relaxed),
                alloc_size: ext.alloc_size.load(Relaxed),
                failed_alloc_count: ext.failed_alloc_count.load(Relaxed),
                failed_alloc_size: ext.failed_alloc_size.load(Relaxed),
                free_count: ext.free_count.load(Relaxed),
                free_size: ext.free_size.load(Relaxed),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_successes_and_failures() {
        let prof = AllocProfState::new(false);
        prof.start();
        for size in [16, 32, 48] {
            prof.record_alloc(size);
        }
        prof.record_failed_alloc(1000);
        prof.record_failed_alloc(24);
        prof.record_free(16);
        prof.record_gc();

        let stats = prof.snapshot();
        assert_eq!(stats.alloc_count, 3);
        assert_eq!(stats.alloc_size, 96);
        assert_eq!(stats.failed_alloc_count, 2);
        assert_eq!(stats.failed_alloc_size, 1024);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.free_size, 16);
        assert_eq!(stats.gc_count, 1);
        assert_eq!(stats.external, None);
    }

    #[test]
    fn disabled_profiler_ignores_events() {
        let prof = AllocProfState::new(true);
        prof.record_alloc(8);
        prof.record_external_alloc(8);
        assert_eq!(prof.snapshot().alloc_count, 0);

        prof.start();
        prof.record_alloc(8);
        prof.stop();
        prof.record_alloc(8);
        assert_eq!(prof.snapshot().alloc_count, 1, "stop keeps values");
    }

    #[test]
    fn start_resets_counters() {
        let prof = AllocProfState::new(true);
        prof.start();
        prof.record_alloc(8);
        prof.record_external_alloc(100);
        prof.stop();
        prof.start();

        let stats = prof.snapshot();
        assert_eq!(stats.alloc_count, 0);
        assert_eq!(stats.external, Some(ExternalAllocStats::default()));
    }

    #[test]
    fn external_counters_mirror_heap_counters() {
        let prof = AllocProfState::new(true);
        prof.start();
        prof.record_external_alloc(100);
        prof.record_failed_external_alloc(50);
        prof.record_external_free(100);

        let ext = prof.snapshot().external.expect("external tracking");
        assert_eq!(ext.alloc_count, 1);
        assert_eq!(ext.alloc_size, 100);
        assert_eq!(ext.failed_alloc_size, 50);
        assert_eq!(ext.free_size, 100);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let prof = Arc::new(AllocProfState::new(false));
        prof.start();

        let joins = (0..8)
            .map(|_| {
                let prof = prof.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        prof.record_alloc(4);
                    }
                })
            })
            .collect::<Vec<_>>();
        for j in joins {
            j.join().unwrap();
        }

        let stats = prof.snapshot();
        assert_eq!(stats.alloc_count, 8000);
        assert_eq!(stats.alloc_size, 32000);
    }
}
