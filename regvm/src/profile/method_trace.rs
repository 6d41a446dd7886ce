use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::atomic::{
        AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize,
        Ordering::{Relaxed, SeqCst},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::{Condvar, Mutex, RwLock};

use super::{
    TraceError, TraceFlags, TraceKey,
    format::{
        self, HEADER_LEN, MethodAction, MethodEntry, RECORD_LEN, TRACE_VERSION,
        ThreadEntry, TraceHeader, TraceRecord,
    },
};
use crate::{MethodId, ThreadId};

/// Where a finished trace is written.
pub enum TraceTarget {
    File(PathBuf),
    Writer(Box<dyn Write + Send>),
}

impl fmt::Debug for TraceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceTarget::File(path) => f.debug_tuple("File").field(path).finish(),
            TraceTarget::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePhase {
    Idle,
    Active,
    /// Stop requested, waiting for in-flight recorders to leave.
    Draining,
}

/// What a finished session wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSummary {
    pub entries: u32,
    pub overflow: u32,
    pub capacity: usize,
    pub elapsed: Duration,
    pub flags: TraceFlags,
}

#[derive(Debug, Default)]
struct TraceSlot {
    thread: AtomicU8,
    method: AtomicU32,
    elapsed: AtomicU32,
}

struct TraceSession {
    sink: Mutex<Box<dyn Write + Send>>,
    slots: Box<[TraceSlot]>,
    cursor: AtomicUsize,
    overflow: AtomicU64,
    start: Instant,
    start_usec: u64,
    flags: TraceFlags,
}

/// Synthetic methods bracketing collector and class-preparation passes.
pub const GC_METHOD: MethodId = MethodId::from_raw(0xffff_fff0);
pub const CLASS_PREP_METHOD: MethodId = MethodId::from_raw(0xffff_fff4);

/// Method trace recorder.
///
/// Recording claims a slot with one atomic increment and never takes a
/// lock. Start and stop are serialized by `control`; stop waits on
/// `drained` until every recorder that saw the session enabled has left.
pub struct MethodTraceState {
    control: Mutex<TracePhase>,
    drained: Condvar,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    session: RwLock<Option<TraceSession>>,
}

impl Default for MethodTraceState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MethodTraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTraceState")
            .field("enabled", &self.enabled.load(Relaxed))
            .field("in_flight", &self.in_flight.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl MethodTraceState {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(TracePhase::Idle),
            drained: Condvar::new(),
            enabled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            session: RwLock::new(None),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Relaxed)
    }

    pub fn phase(&self) -> TracePhase {
        *self.control.lock()
    }

    /// Number of records a buffer of `buffer_size` bytes holds.
    pub fn capacity_for(buffer_size: usize) -> usize {
        buffer_size.saturating_sub(HEADER_LEN) / RECORD_LEN
    }

    pub fn start(
        &self,
        target: TraceTarget,
        buffer_size: usize,
        flags: TraceFlags,
    ) -> Result<(), TraceError> {
        let mut phase = self.control.lock();
        if *phase != TracePhase::Idle {
            log::warn!("method trace start requested while already tracing");
            return Err(TraceError::AlreadyTracing);
        }

        let capacity = Self::capacity_for(buffer_size);
        if capacity == 0 {
            return Err(TraceError::BufferTooSmall {
                size: buffer_size,
                minimum: HEADER_LEN + RECORD_LEN,
            });
        }

        let sink: Box<dyn Write + Send> = match target {
            TraceTarget::File(path) => {
                let file = File::create(&path).map_err(TraceError::Io)?;
                log::info!("method trace writing to {}", path.display());
                Box::new(BufWriter::new(file))
            }
            TraceTarget::Writer(writer) => writer,
        };

        let slots = (0..capacity)
            .map(|_| TraceSlot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let start_usec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        *self.session.write() = Some(TraceSession {
            sink: Mutex::new(sink),
            slots,
            cursor: AtomicUsize::new(0),
            overflow: AtomicU64::new(0),
            start: Instant::now(),
            start_usec,
            flags,
        });
        self.enabled.store(true, SeqCst);
        *phase = TracePhase::Active;

        log::info!(
            "method trace started: {capacity} slots ({buffer_size} bytes), flags {flags:?}"
        );
        Ok(())
    }

    /// Record one event. Dropped and counted as overflow when the buffer
    /// is full; a no-op outside a session.
    pub fn add(&self, thread: ThreadId, method: MethodId, action: MethodAction) {
        if !self.enabled.load(Relaxed) {
            return;
        }

        self.in_flight.fetch_add(1, SeqCst);
        if self.enabled.load(SeqCst) {
            if let Some(session) = self.session.read().as_ref() {
                session.record(thread, method, action);
            }
        }
        if self.in_flight.fetch_sub(1, SeqCst) == 1 && !self.enabled.load(SeqCst) {
            // a stop may be waiting for us; notify under the lock so the
            // wakeup cannot slip in between its check and its wait
            let _phase = self.control.lock();
            self.drained.notify_all();
        }
    }

    pub fn stop(&self, key: &dyn TraceKey) -> Result<TraceSummary, TraceError> {
        let mut phase = self.control.lock();
        if *phase != TracePhase::Active {
            log::warn!("method trace stop requested while not tracing");
            return Err(TraceError::NotTracing);
        }

        *phase = TracePhase::Draining;
        self.enabled.store(false, SeqCst);
        while self.in_flight.load(SeqCst) != 0 {
            self.drained.wait(&mut phase);
        }

        let session = self.session.write().take();
        *phase = TracePhase::Idle;
        drop(phase);

        let session = session.ok_or(TraceError::NotTracing)?;
        let summary = session.finish(key)?;
        if summary.overflow != 0 {
            log::warn!(
                "method trace buffer overflowed: {} events dropped",
                summary.overflow
            );
        }
        log::info!(
            "method trace stopped: {} entries in {:?}",
            summary.entries,
            summary.elapsed
        );
        Ok(summary)
    }

    pub fn gc_begin(&self, thread: ThreadId) {
        self.add(thread, GC_METHOD, MethodAction::Enter);
    }

    pub fn gc_end(&self, thread: ThreadId) {
        self.add(thread, GC_METHOD, MethodAction::Exit);
    }

    pub fn class_prep_begin(&self, thread: ThreadId) {
        self.add(thread, CLASS_PREP_METHOD, MethodAction::Enter);
    }

    pub fn class_prep_end(&self, thread: ThreadId) {
        self.add(thread, CLASS_PREP_METHOD, MethodAction::Exit);
    }

    /// Claim `claims` slots directly, returning the indices handed out.
    #[cfg(test)]
    fn claim_for_test(&self, claims: usize) -> Vec<usize> {
        let session = self.session.read();
        let session = session.as_ref().expect("active session");
        (0..claims)
            .filter_map(|_| session.claim())
            .collect()
    }
}

impl TraceSession {
    #[inline]
    fn claim(&self) -> Option<usize> {
        let index = self.cursor.fetch_add(1, Relaxed);
        if index < self.slots.len() {
            Some(index)
        } else {
            self.overflow.fetch_add(1, Relaxed);
            None
        }
    }

    #[inline]
    fn record(&self, thread: ThreadId, method: MethodId, action: MethodAction) {
        let Some(index) = self.claim() else {
            return;
        };
        let elapsed = self.start.elapsed().as_micros().min(u32::MAX as u128) as u32;
        let slot = &self.slots[index];
        slot.thread.store(thread.0, Relaxed);
        slot.method.store(format::combine(method, action), Relaxed);
        slot.elapsed.store(elapsed, Relaxed);
    }

    fn entries(&self) -> usize {
        self.cursor.load(SeqCst).min(self.slots.len())
    }

    fn finish(mut self, key: &dyn TraceKey) -> Result<TraceSummary, TraceError> {
        let entries = self.entries();
        let overflow = self.overflow.load(SeqCst).min(u32::MAX as u64) as u32;
        let elapsed = self.start.elapsed();

        let records = self.slots[..entries]
            .iter()
            .filter_map(|slot| {
                let encoded = slot.method.load(Relaxed);
                Some(TraceRecord {
                    thread: ThreadId(slot.thread.load(Relaxed)),
                    method: format::method_id(encoded),
                    action: MethodAction::from_bits(encoded)?,
                    elapsed_usec: slot.elapsed.load(Relaxed),
                })
            })
            .collect::<Vec<_>>();

        let seen = records
            .iter()
            .map(|record| record.method)
            .chain([GC_METHOD, CLASS_PREP_METHOD])
            .collect::<BTreeSet<_>>();
        let methods = seen
            .into_iter()
            .map(|id| method_entry(key, id))
            .collect::<Vec<_>>();
        let threads = key.threads();

        let header = TraceHeader {
            version: TRACE_VERSION,
            start_usec: self.start_usec,
            overflow,
            entries: records.len() as u32,
        };

        let sink = self.sink.get_mut();
        format::write_key(&mut *sink, overflow, &threads, &methods)?;
        header.write_to(&mut *sink)?;
        for record in &records {
            sink.write_all(&record.encode())?;
        }
        sink.flush()?;

        Ok(TraceSummary {
            entries: header.entries,
            overflow,
            capacity: self.slots.len(),
            elapsed,
            flags: self.flags,
        })
    }
}

fn method_entry(key: &dyn TraceKey, id: MethodId) -> MethodEntry {
    let synthetic = |name: &str| MethodEntry {
        id,
        class: "Lregvm/system/VMDebug;".to_string(),
        name: name.to_string(),
        signature: "()V".to_string(),
    };
    match id {
        GC_METHOD => synthetic("(gc)"),
        CLASS_PREP_METHOD => synthetic("(class prep)"),
        _ => key.method_entry(id).unwrap_or_else(|| MethodEntry {
            id,
            class: "(unknown)".to_string(),
            name: "(unknown)".to_string(),
            signature: "()V".to_string(),
        }),
    }
}
