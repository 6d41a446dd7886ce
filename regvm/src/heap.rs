use std::{
    collections::HashSet,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    AllocFlags, AllocSite, Allocator, ClassHandle, ObjectLayout, Profiler,
    ThreadId, Throwable, ThrowableKind, profile::AllocProfState,
};

/// A reference to a live heap object. Stored in registers as its raw value;
/// 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(NonZeroU32);

impl ObjectRef {
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        u32::try_from(raw).ok().and_then(NonZeroU32::new).map(Self)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0.get() as u64
    }

    #[inline]
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeapCreateInfo {
    /// byte limit of the object heap
    pub size: usize,
    pub header_size: Option<usize>,
    /// byte limit for allocations made outside the heap
    pub external_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct HeapSettings {
    header_size: usize,
    external_limit: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            header_size: 16,
            external_limit: usize::MAX,
        }
    }
}

#[derive(Debug)]
struct HeapObject {
    class: ClassHandle,
    slots: Box<[u64]>,
    /// bytes charged, header included
    size: usize,
}

#[derive(Debug, Default)]
struct HeapState {
    objects: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    used: usize,
    /// objects nothing roots yet; released explicitly
    tracked: HashSet<ObjectRef>,
    /// released objects waiting for the next collection
    garbage: Vec<ObjectRef>,
}

impl HeapState {
    fn get(&self, obj: ObjectRef) -> Option<&HeapObject> {
        self.objects.get(obj.index())?.as_ref()
    }

    fn get_mut(&mut self, obj: ObjectRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(obj.index())?.as_mut()
    }

    fn remove(&mut self, obj: ObjectRef) -> Option<HeapObject> {
        let object = self.objects.get_mut(obj.index())?.take()?;
        self.used -= object.size;
        self.free.push(obj.index() as u32);
        self.tracked.remove(&obj);
        Some(object)
    }
}

/// Reference object heap.
///
/// Objects live in a slab behind one lock. There is no tracing: an object
/// dies when it is freed, or at the next collection after it is released.
/// Running out of space triggers one collection before the allocation
/// fails with `OutOfMemory`.
#[derive(Debug)]
pub struct Heap {
    size: usize,
    settings: HeapSettings,
    state: Mutex<HeapState>,
    external_used: AtomicUsize,
    gc_count: AtomicU64,
    profiler: Arc<Profiler>,
}

fn stale(obj: ObjectRef) -> Throwable {
    Throwable::verify_error(format!("stale object reference {}", obj.raw()))
}

impl Heap {
    pub fn new(info: HeapCreateInfo, profiler: Arc<Profiler>) -> Self {
        let mut settings = HeapSettings::default();
        info.header_size.inspect(|&val| settings.header_size = val);
        info.external_limit
            .inspect(|&val| settings.external_limit = val);

        Self {
            size: info.size,
            settings,
            state: Mutex::new(HeapState::default()),
            external_used: AtomicUsize::new(0),
            gc_count: AtomicU64::new(0),
            profiler,
        }
    }

    pub fn limit(&self) -> usize {
        self.size
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn object_count(&self) -> usize {
        let state = self.state.lock();
        state.objects.len() - state.free.len()
    }

    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Relaxed)
    }

    fn try_allocate(
        &self,
        class: &ClassHandle,
        slots: usize,
        size: usize,
        flags: AllocFlags,
    ) -> Option<ObjectRef> {
        let mut state = self.state.lock();
        if state.used.checked_add(size)? > self.size {
            return None;
        }
        let index = match state.free.last() {
            Some(&index) => index,
            None => u32::try_from(state.objects.len()).ok()?,
        };
        let obj = ObjectRef(NonZeroU32::new(index.checked_add(1)?)?);

        let object = HeapObject {
            class: class.clone(),
            slots: vec![0; slots].into_boxed_slice(),
            size,
        };
        if state.free.pop().is_some() {
            state.objects[index as usize] = Some(object);
        } else {
            state.objects.push(Some(object));
        }
        state.used += size;
        if !flags.contains(AllocFlags::DONT_TRACK) {
            state.tracked.insert(obj);
        }
        Some(obj)
    }

    /// Run a collection pass, reclaiming every released object.
    pub fn collect(&self, thread: ThreadId, profile: &AllocProfState) -> usize {
        self.profiler.gc_begin(thread);
        let (count, reclaimed) = {
            let mut state = self.state.lock();
            let garbage = std::mem::take(&mut state.garbage);
            let mut count = 0;
            let mut reclaimed = 0;
            for obj in garbage {
                if let Some(object) = state.remove(obj) {
                    count += 1;
                    reclaimed += object.size;
                    self.profiler.alloc().record_free(object.size);
                    profile.record_free(object.size);
                }
            }
            (count, reclaimed)
        };
        self.gc_count.fetch_add(1, Ordering::Relaxed);
        self.profiler.alloc().record_gc();
        profile.record_gc();
        self.profiler.gc_end(thread);
        log::debug!("gc: reclaimed {count} objects, {reclaimed} bytes");
        reclaimed
    }

    /// Free `obj` immediately.
    pub fn free(&self, obj: ObjectRef, site: AllocSite<'_>) -> Result<usize, Throwable> {
        let object = self.state.lock().remove(obj).ok_or_else(|| stale(obj))?;
        self.profiler.alloc().record_free(object.size);
        site.profile.record_free(object.size);
        Ok(object.size)
    }

    /// Hand `obj` to the next collection.
    pub fn release(&self, obj: ObjectRef) {
        let mut state = self.state.lock();
        state.tracked.remove(&obj);
        state.garbage.push(obj);
    }

    /// Drop `obj` from the tracked-allocation set. Returns whether it was
    /// tracked.
    pub fn release_tracked_alloc(&self, obj: ObjectRef) -> bool {
        self.state.lock().tracked.remove(&obj)
    }

    pub fn is_tracked(&self, obj: ObjectRef) -> bool {
        self.state.lock().tracked.contains(&obj)
    }

    pub fn class_of(&self, obj: ObjectRef) -> Option<ClassHandle> {
        self.state.lock().get(obj).map(|o| o.class.clone())
    }

    pub fn array_length(&self, obj: ObjectRef) -> Result<usize, Throwable> {
        let state = self.state.lock();
        let object = state.get(obj).ok_or_else(|| stale(obj))?;
        if !object.class.is_array() {
            return Err(Throwable::verify_error(format!(
                "array-length on {}",
                object.class.descriptor
            )));
        }
        Ok(object.slots.len())
    }

    pub fn array_get(&self, obj: ObjectRef, index: i32) -> Result<u64, Throwable> {
        let state = self.state.lock();
        let object = state.get(obj).ok_or_else(|| stale(obj))?;
        let len = object.slots.len();
        usize::try_from(index)
            .ok()
            .and_then(|i| object.slots.get(i).copied())
            .ok_or_else(|| Throwable::index_out_of_bounds(len, index))
    }

    pub fn array_put(
        &self,
        obj: ObjectRef,
        index: i32,
        value: u64,
    ) -> Result<(), Throwable> {
        let mut state = self.state.lock();
        let object = state.get_mut(obj).ok_or_else(|| stale(obj))?;
        let len = object.slots.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| object.slots.get_mut(i))
            .ok_or_else(|| Throwable::index_out_of_bounds(len, index))?;
        *slot = value;
        Ok(())
    }

    /// Account for `bytes` allocated outside the heap. Fails when the
    /// external limit would be exceeded.
    pub fn track_external_alloc(&self, bytes: usize, site: AllocSite<'_>) -> bool {
        let limit = self.settings.external_limit;
        let ok = self
            .external_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .is_ok();
        if ok {
            self.profiler.alloc().record_external_alloc(bytes);
            site.profile.record_external_alloc(bytes);
        } else {
            self.profiler.alloc().record_failed_external_alloc(bytes);
            site.profile.record_failed_external_alloc(bytes);
        }
        ok
    }

    pub fn track_external_free(&self, bytes: usize, site: AllocSite<'_>) {
        let _ = self
            .external_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
        self.profiler.alloc().record_external_free(bytes);
        site.profile.record_external_free(bytes);
    }

    pub fn external_used(&self) -> usize {
        self.external_used.load(Ordering::Relaxed)
    }
}

impl Allocator for Heap {
    fn allocate(
        &self,
        class: &ClassHandle,
        layout: ObjectLayout,
        flags: AllocFlags,
        site: AllocSite<'_>,
    ) -> Result<ObjectRef, Throwable> {
        let size = self.settings.header_size.saturating_add(layout.size);
        let obj = match self.try_allocate(class, layout.slots, size, flags) {
            Some(obj) => obj,
            None => {
                self.collect(site.thread, site.profile);
                match self.try_allocate(class, layout.slots, size, flags) {
                    Some(obj) => obj,
                    None => {
                        self.profiler.alloc().record_failed_alloc(size);
                        site.profile.record_failed_alloc(size);
                        log::warn!(
                            "out of memory allocating {size} bytes for {}",
                            class.descriptor
                        );
                        return Err(Throwable::with_message(
                            ThrowableKind::OutOfMemory,
                            format!("failed to allocate {size} bytes"),
                        ));
                    }
                }
            }
        };
        self.profiler.alloc().record_alloc(size);
        site.profile.record_alloc(size);
        Ok(obj)
    }
}
