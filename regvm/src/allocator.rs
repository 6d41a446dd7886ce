use bitflags::bitflags;

use crate::{
    ClassHandle, ClassKind, ObjectRef, ThreadId, Throwable,
    profile::AllocProfState,
};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct AllocFlags: u8 {
        /// Do not add the object to the tracked-allocation set.
        const DONT_TRACK = 1 << 0;
    }
}

/// Who is allocating: charged alongside the process-wide counters.
#[derive(Debug, Clone, Copy)]
pub struct AllocSite<'a> {
    pub thread: ThreadId,
    pub profile: &'a AllocProfState,
}

/// Shape of an object body, excluding the heap's per-object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    /// number of value slots
    pub slots: usize,
    /// payload size in bytes
    pub size: usize,
}

pub trait Allocator {
    fn allocate(
        &self,
        class: &ClassHandle,
        layout: ObjectLayout,
        flags: AllocFlags,
        site: AllocSite<'_>,
    ) -> Result<ObjectRef, Throwable>;

    /// Allocate a zeroed array of `length` elements of `class`.
    fn alloc_array_by_class(
        &self,
        class: &ClassHandle,
        length: usize,
        flags: AllocFlags,
        site: AllocSite<'_>,
    ) -> Result<ObjectRef, Throwable> {
        let Some(component) = class.component() else {
            return Err(Throwable::verify_error(format!(
                "{} is not an array class",
                class.descriptor
            )));
        };
        // an overflowing size can never fit, let the heap report it
        let size = length.saturating_mul(component.width());
        self.allocate(class, ObjectLayout { slots: length, size }, flags, site)
    }

    fn alloc_object(
        &self,
        class: &ClassHandle,
        flags: AllocFlags,
        site: AllocSite<'_>,
    ) -> Result<ObjectRef, Throwable> {
        let ClassKind::Instance { field_count } = class.kind else {
            return Err(Throwable::verify_error(format!(
                "{} cannot be instantiated",
                class.descriptor
            )));
        };
        let layout = ObjectLayout {
            slots: field_count,
            size: field_count * 4,
        };
        self.allocate(class, layout, flags, site)
    }
}
