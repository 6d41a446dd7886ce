//! Method tracing and allocation profiling.
//!
//! Everything hangs off one [`Profiler`] shared by all threads of a VM. The
//! interpreter reports through the inline hooks below; each costs a single
//! relaxed load of the `active_profilers` gate while nothing is running.

pub mod alloc;
pub mod emulator;
pub mod format;
pub mod instructions;
pub mod method_trace;

use std::{
    io,
    sync::atomic::{
        AtomicBool, AtomicUsize,
        Ordering::{Relaxed, SeqCst},
    },
};

use bitflags::bitflags;
use parking_lot::Mutex;
use thiserror::Error;

pub use self::alloc::{AllocProfState, AllocStats, ExternalAllocStats};
pub use emulator::{EmulatorEvent, EmulatorTrace};
pub use format::{MethodAction, MethodEntry, ThreadEntry, TraceFile};
pub use instructions::InstructionCounts;
pub use method_trace::{
    CLASS_PREP_METHOD, GC_METHOD, MethodTraceState, TracePhase, TraceSummary,
    TraceTarget,
};

use crate::{MethodId, ThreadId, bytecode::Op};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TraceFlags: u32 {
        /// Count allocations for the length of the trace session.
        const ALLOC_COUNTS = 0x01;
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("method tracing is already active")]
    AlreadyTracing,
    #[error("tracing is not active")]
    NotTracing,
    #[error("instruction counting is not active")]
    NotCounting,
    #[error("trace buffer of {size} bytes is below the minimum of {minimum}")]
    BufferTooSmall { size: usize, minimum: usize },
    #[error("trace output failed: {0}")]
    Io(#[from] io::Error),
}

/// Names for the ids that appear in a trace.
pub trait TraceKey {
    fn method_entry(&self, id: MethodId) -> Option<MethodEntry>;
    fn threads(&self) -> Vec<ThreadEntry>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilerCreateInfo {
    /// default trace buffer size in bytes
    pub buffer_size: Option<usize>,
    pub track_external_allocations: Option<bool>,
    pub emulator_queue: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProfilerSettings {
    pub buffer_size: usize,
    pub track_external_allocations: bool,
    pub emulator_queue: usize,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024 * 1024,
            track_external_allocations: true,
            emulator_queue: 1024,
        }
    }
}

#[derive(Debug)]
pub struct Profiler {
    /// number of enabled consumers of method and instruction events
    active_profilers: AtomicUsize,
    method_trace: MethodTraceState,
    emulator: EmulatorTrace,
    instructions: InstructionCounts,
    alloc: AllocProfState,
    /// the running trace session turned on allocation counting
    trace_counts_allocs: AtomicBool,
    /// held across a trace start or stop and the gate and alloc-counting
    /// changes that go with it
    trace_lifecycle: Mutex<()>,
    settings: ProfilerSettings,
}

impl Profiler {
    pub fn startup(info: ProfilerCreateInfo) -> Self {
        let mut settings = ProfilerSettings::default();
        info.buffer_size.inspect(|&val| settings.buffer_size = val);
        info.track_external_allocations
            .inspect(|&val| settings.track_external_allocations = val);
        info.emulator_queue
            .inspect(|&val| settings.emulator_queue = val);

        log::debug!("profiler started: {settings:?}");
        Self {
            active_profilers: AtomicUsize::new(0),
            method_trace: MethodTraceState::new(),
            emulator: EmulatorTrace::new(),
            instructions: InstructionCounts::new(),
            alloc: AllocProfState::new(settings.track_external_allocations),
            trace_counts_allocs: AtomicBool::new(false),
            trace_lifecycle: Mutex::new(()),
            settings,
        }
    }

    /// Stop everything still running. A trace in progress is written out.
    pub fn shutdown(&self, key: &dyn TraceKey) {
        if self.method_trace.phase() == TracePhase::Active {
            match self.stop_method_tracing(key) {
                Ok(summary) => log::info!(
                    "shutdown: wrote pending method trace ({} entries)",
                    summary.entries
                ),
                Err(err) => log::warn!("shutdown: method trace lost: {err}"),
            }
        }
        let emulator = self.emulator.reset();
        if emulator != 0 {
            log::info!("shutdown: emulator tracing disabled");
            self.emulator.disconnect();
        }
        if self.instructions.reset_enable() != 0 {
            log::info!("shutdown: instruction counting disabled");
        }
        if self.alloc.is_enabled() {
            log::info!("shutdown: allocation counting disabled");
            self.alloc.stop();
        }
        self.active_profilers.store(0, SeqCst);
    }

    pub fn settings(&self) -> &ProfilerSettings {
        &self.settings
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active_profilers.load(Relaxed) != 0
    }

    pub fn method_trace(&self) -> &MethodTraceState {
        &self.method_trace
    }

    pub fn emulator(&self) -> &EmulatorTrace {
        &self.emulator
    }

    pub fn instructions(&self) -> &InstructionCounts {
        &self.instructions
    }

    /// The process-wide allocation counters.
    pub fn alloc(&self) -> &AllocProfState {
        &self.alloc
    }

    fn gate_down(&self) {
        let _ = self
            .active_profilers
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1));
    }

    pub fn start_method_tracing(
        &self,
        target: TraceTarget,
        buffer_size: usize,
        flags: TraceFlags,
    ) -> Result<(), TraceError> {
        let _lifecycle = self.trace_lifecycle.lock();
        self.method_trace.start(target, buffer_size, flags)?;
        if flags.contains(TraceFlags::ALLOC_COUNTS) {
            self.alloc.start();
            self.trace_counts_allocs.store(true, SeqCst);
        }
        self.active_profilers.fetch_add(1, SeqCst);
        Ok(())
    }

    pub fn stop_method_tracing(
        &self,
        key: &dyn TraceKey,
    ) -> Result<TraceSummary, TraceError> {
        let _lifecycle = self.trace_lifecycle.lock();
        if self.method_trace.phase() != TracePhase::Active {
            log::warn!("method trace stop requested while not tracing");
            return Err(TraceError::NotTracing);
        }
        // the session is over even when writing it out fails
        let result = self.method_trace.stop(key);
        if self.trace_counts_allocs.swap(false, SeqCst) {
            self.alloc.stop();
        }
        self.gate_down();
        result
    }

    pub fn start_emulator_tracing(&self) {
        self.emulator.start();
        self.active_profilers.fetch_add(1, SeqCst);
    }

    pub fn stop_emulator_tracing(&self) -> Result<(), TraceError> {
        self.emulator.stop()?;
        self.gate_down();
        Ok(())
    }

    pub fn start_instruction_counting(&self) {
        self.instructions.start();
        self.active_profilers.fetch_add(1, SeqCst);
    }

    pub fn stop_instruction_counting(&self) -> Result<(), TraceError> {
        self.instructions.stop()?;
        self.gate_down();
        Ok(())
    }

    pub fn instruction_counts(&self) -> Vec<u64> {
        self.instructions.snapshot()
    }

    pub fn start_alloc_counting(&self) {
        self.alloc.start();
    }

    pub fn stop_alloc_counting(&self) -> AllocStats {
        self.alloc.stop();
        self.alloc.snapshot()
    }

    #[inline]
    pub fn method_enter(&self, thread: ThreadId, method: MethodId) {
        if self.is_active() {
            self.method_event(thread, method, MethodAction::Enter);
        }
    }

    #[inline]
    pub fn method_exit(&self, thread: ThreadId, method: MethodId) {
        if self.is_active() {
            self.method_event(thread, method, MethodAction::Exit);
        }
    }

    #[inline]
    pub fn method_unwind(&self, thread: ThreadId, method: MethodId) {
        if self.is_active() {
            self.method_event(thread, method, MethodAction::Unwind);
        }
    }

    #[cold]
    fn method_event(&self, thread: ThreadId, method: MethodId, action: MethodAction) {
        self.method_trace.add(thread, method, action);
        self.emulator.emit(method, action);
    }

    #[inline]
    pub fn count_instruction(&self, op: Op) {
        if self.is_active() {
            self.instructions.count(op);
        }
    }

    pub fn gc_begin(&self, thread: ThreadId) {
        if self.is_active() {
            self.method_trace.gc_begin(thread);
        }
    }

    pub fn gc_end(&self, thread: ThreadId) {
        if self.is_active() {
            self.method_trace.gc_end(thread);
        }
    }

    pub fn class_prep_begin(&self, thread: ThreadId) {
        if self.is_active() {
            self.method_trace.class_prep_begin(thread);
        }
    }

    pub fn class_prep_end(&self, thread: ThreadId) {
        if self.is_active() {
            self.method_trace.class_prep_end(thread);
        }
    }
}
