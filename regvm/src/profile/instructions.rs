use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};

use super::TraceError;
use crate::bytecode::Op;

/// Per-opcode execution counts.
#[derive(Debug)]
pub struct InstructionCounts {
    enable_count: AtomicUsize,
    counts: Box<[AtomicU64]>,
}

impl Default for InstructionCounts {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionCounts {
    pub fn new() -> Self {
        Self {
            enable_count: AtomicUsize::new(0),
            counts: (0..Op::COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enable_count.load(Relaxed) != 0
    }

    pub fn start(&self) -> usize {
        self.enable_count.fetch_add(1, Relaxed) + 1
    }

    pub fn stop(&self) -> Result<usize, TraceError> {
        self.enable_count
            .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| TraceError::NotCounting)
    }

    pub(super) fn reset_enable(&self) -> usize {
        self.enable_count.swap(0, Relaxed)
    }

    #[inline]
    pub fn count(&self, op: Op) {
        if self.is_enabled() {
            self.counts[op as usize].fetch_add(1, Relaxed);
        }
    }

    pub fn get(&self, op: Op) -> u64 {
        self.counts[op as usize].load(Relaxed)
    }

    /// Copy of all 256 counters, indexed by opcode byte.
    pub fn snapshot(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Relaxed)).collect()
    }

    pub fn reset(&self) {
        for c in self.counts.iter() {
            c.store(0, Relaxed);
        }
    }
}
