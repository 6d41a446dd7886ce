use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::profile::{AllocProfState, AllocStats, ThreadEntry};

/// Identifier of a VM thread as it appears in trace records.
///
/// Ids are handed out from 1 and wrap within `1..=255`; 0 is never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Running,
    Dead,
}

#[derive(Debug)]
pub struct ThreadInfo {
    pub state: ThreadState,
    pub name: String,
}

#[derive(Debug)]
pub struct ThreadShared {
    pub id: ThreadId,
    pub info: Mutex<ThreadInfo>,
    /// allocation counters for this thread only
    pub alloc: AllocProfState,
}

#[derive(Debug, Clone)]
pub struct ThreadProxy(pub Arc<ThreadShared>);

impl Deref for ThreadProxy {
    type Target = ThreadShared;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ThreadShared {
    pub fn name(&self) -> String {
        self.info.lock().name.clone()
    }

    pub fn state(&self) -> ThreadState {
        self.info.lock().state
    }

    pub fn set_state(&self, state: ThreadState) {
        self.info.lock().state = state;
    }

    pub fn start_alloc_counting(&self) {
        self.alloc.start();
    }

    pub fn stop_alloc_counting(&self) -> AllocStats {
        self.alloc.stop();
        self.alloc.snapshot()
    }
}

/// Threads attached to a VM.
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: RwLock<Vec<ThreadProxy>>,
    attached: AtomicU32,
}

impl ThreadList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, name: &str, track_external: bool) -> ThreadProxy {
        let n = self.attached.fetch_add(1, Ordering::Relaxed);
        let id = ThreadId((n % 255) as u8 + 1);
        let thread = ThreadProxy(Arc::new(ThreadShared {
            id,
            info: Mutex::new(ThreadInfo {
                state: ThreadState::Created,
                name: name.to_string(),
            }),
            alloc: AllocProfState::new(track_external),
        }));
        self.threads.write().push(thread.clone());
        log::debug!("attached thread {} as {name:?}", id.0);
        thread
    }

    /// Mark `thread` dead and forget it. Trace keys written later no longer
    /// list it.
    pub fn detach(&self, thread: &ThreadProxy) {
        thread.set_state(ThreadState::Dead);
        self.threads
            .write()
            .retain(|t| !Arc::ptr_eq(&t.0, &thread.0));
    }

    pub fn entries(&self) -> Vec<ThreadEntry> {
        self.threads
            .read()
            .iter()
            .map(|t| ThreadEntry {
                id: t.id,
                name: t.name(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}
