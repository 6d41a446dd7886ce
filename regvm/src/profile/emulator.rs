use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed},
    mpsc::{self, Receiver, SyncSender, TrySendError},
};

use parking_lot::RwLock;

use super::{TraceError, format::MethodAction};
use crate::MethodId;

/// A method event mirrored to an attached emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorEvent {
    pub method: MethodId,
    pub action: MethodAction,
}

/// Forwards method events to an out-of-process consumer.
///
/// Enabling is counted so independent requesters can nest. Events are
/// pushed with `try_send`; a slow or missing consumer never blocks the
/// interpreter, it only bumps `dropped`.
#[derive(Debug, Default)]
pub struct EmulatorTrace {
    enable_count: AtomicUsize,
    consumer: RwLock<Option<SyncSender<EmulatorEvent>>>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl EmulatorTrace {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enable_count.load(Relaxed) != 0
    }

    pub fn enable_count(&self) -> usize {
        self.enable_count.load(Relaxed)
    }

    /// Attach a consumer, replacing any previous one.
    pub fn connect(&self, capacity: usize) -> Receiver<EmulatorEvent> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        *self.consumer.write() = Some(tx);
        log::debug!("emulator consumer attached (queue {capacity})");
        rx
    }

    pub fn disconnect(&self) {
        self.consumer.write().take();
    }

    pub fn start(&self) -> usize {
        let count = self.enable_count.fetch_add(1, Relaxed) + 1;
        log::debug!("emulator tracing enabled ({count})");
        count
    }

    pub fn stop(&self) -> Result<usize, TraceError> {
        let previous = self
            .enable_count
            .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
            .map_err(|_| TraceError::NotTracing)?;
        log::debug!("emulator tracing disabled ({})", previous - 1);
        Ok(previous - 1)
    }

    /// Force the enable count to zero, returning what it was.
    pub(super) fn reset(&self) -> usize {
        self.enable_count.swap(0, Relaxed)
    }

    pub fn emit(&self, method: MethodId, action: MethodAction) {
        if !self.is_enabled() {
            return;
        }
        // a writer is only ever connecting or disconnecting; skip rather than wait
        let Some(consumer) = self.consumer.try_read() else {
            self.dropped.fetch_add(1, Relaxed);
            return;
        };
        let Some(tx) = consumer.as_ref() else {
            self.dropped.fetch_add(1, Relaxed);
            return;
        };
        match tx.try_send(EmulatorEvent { method, action }) {
            Ok(()) => {
                self.emitted.fetch_add(1, Relaxed);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Relaxed);
            }
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Relaxed)
    }
}
