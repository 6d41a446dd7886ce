use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{Profiler, ThreadId, Throwable, ThrowableKind};

/// Element type of an array class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl ComponentType {
    /// Element type named by a complete field descriptor: one primitive
    /// character, `L<name>;` or `[<descriptor>`. Anything else is `None`.
    pub fn from_descriptor(descriptor: &str) -> Option<Self> {
        let ty = match descriptor.as_bytes() {
            [b'Z'] => ComponentType::Boolean,
            [b'B'] => ComponentType::Byte,
            [b'C'] => ComponentType::Char,
            [b'S'] => ComponentType::Short,
            [b'I'] => ComponentType::Int,
            [b'F'] => ComponentType::Float,
            [b'J'] => ComponentType::Long,
            [b'D'] => ComponentType::Double,
            [b'L', name @ .., b';'] if is_class_name(name) => ComponentType::Reference,
            [b'[', ..] => {
                Self::from_descriptor(&descriptor[1..])?;
                ComponentType::Reference
            }
            _ => return None,
        };
        Some(ty)
    }

    /// Storage width of one element in bytes.
    pub const fn width(self) -> usize {
        match self {
            ComponentType::Boolean | ComponentType::Byte => 1,
            ComponentType::Char | ComponentType::Short => 2,
            ComponentType::Int | ComponentType::Float => 4,
            ComponentType::Long | ComponentType::Double => 8,
            ComponentType::Reference => 4,
        }
    }

    pub const fn is_primitive(self) -> bool {
        !matches!(self, ComponentType::Reference)
    }
}

fn is_class_name(name: &[u8]) -> bool {
    name.split(|&b| b == b'/').all(|part| {
        !part.is_empty() && !part.iter().any(|&b| matches!(b, b';' | b'[' | b'.'))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Instance { field_count: usize },
    Array { component: ComponentType },
}

#[derive(Debug)]
pub struct Class {
    pub descriptor: String,
    pub kind: ClassKind,
    initialized: AtomicBool,
}

pub type ClassHandle = Arc<Class>;

impl Class {
    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array { .. })
    }

    pub fn component(&self) -> Option<ComponentType> {
        match self.kind {
            ClassKind::Array { component } => Some(component),
            ClassKind::Instance { .. } => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

/// Per-module class reference table with a resolution cache.
#[derive(Debug)]
pub struct ConstantPool {
    class_refs: Box<[String]>,
    resolved: RwLock<Box<[Option<ClassHandle>]>>,
}

impl ConstantPool {
    pub fn new(class_refs: Vec<String>) -> Self {
        let resolved = vec![None; class_refs.len()].into_boxed_slice();
        Self {
            class_refs: class_refs.into_boxed_slice(),
            resolved: RwLock::new(resolved),
        }
    }

    pub fn class_ref(&self, index: u16) -> Option<&str> {
        self.class_refs.get(index as usize).map(String::as_str)
    }

    /// Cached resolution of `index`, if one happened already.
    #[inline]
    pub fn resolved_class(&self, index: u16) -> Option<ClassHandle> {
        self.resolved.read().get(index as usize).cloned().flatten()
    }

    fn set_resolved(&self, index: u16, class: ClassHandle) {
        if let Some(slot) = self.resolved.write().get_mut(index as usize) {
            *slot = Some(class);
        }
    }

    pub fn len(&self) -> usize {
        self.class_refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_refs.is_empty()
    }
}

/// Loads classes by descriptor. Array classes are created on first use;
/// anything else must have been defined up front.
#[derive(Debug)]
pub struct ClassLinker {
    classes: RwLock<HashMap<String, ClassHandle>>,
    profiler: Arc<Profiler>,
}

impl ClassLinker {
    pub fn new(profiler: Arc<Profiler>) -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
            profiler,
        }
    }

    pub fn define_class(
        &self,
        descriptor: &str,
        field_count: usize,
        thread: ThreadId,
    ) -> ClassHandle {
        if let Some(existing) = self.classes.read().get(descriptor) {
            return existing.clone();
        }
        self.prepare(
            descriptor,
            ClassKind::Instance { field_count },
            thread,
        )
    }

    pub fn find_class(
        &self,
        descriptor: &str,
        thread: ThreadId,
    ) -> Result<ClassHandle, Throwable> {
        if let Some(class) = self.classes.read().get(descriptor) {
            return Ok(class.clone());
        }

        let no_class =
            || Throwable::with_message(ThrowableKind::NoClassDefFound, descriptor);
        let component_desc = descriptor.strip_prefix('[').ok_or_else(no_class)?;
        let component =
            ComponentType::from_descriptor(component_desc).ok_or_else(no_class)?;
        if !component.is_primitive() {
            // the element class has to exist for the array class to
            self.find_class(component_desc, thread)?;
        }
        Ok(self.prepare(descriptor, ClassKind::Array { component }, thread))
    }

    /// Resolve entry `index` of `pool`, caching the result in the pool.
    pub fn resolve_class(
        &self,
        pool: &ConstantPool,
        index: u16,
        thread: ThreadId,
    ) -> Result<ClassHandle, Throwable> {
        if let Some(class) = pool.resolved_class(index) {
            return Ok(class);
        }
        let descriptor = pool.class_ref(index).ok_or_else(|| {
            Throwable::verify_error(format!("class index {index} out of range"))
        })?;
        let class = self.find_class(descriptor, thread)?;
        pool.set_resolved(index, class.clone());
        Ok(class)
    }

    fn prepare(&self, descriptor: &str, kind: ClassKind, thread: ThreadId) -> ClassHandle {
        self.profiler.class_prep_begin(thread);
        let class = {
            let mut classes = self.classes.write();
            classes
                .entry(descriptor.to_string())
                .or_insert_with(|| {
                    log::debug!("preparing class {descriptor}");
                    let class = Arc::new(Class {
                        descriptor: descriptor.to_string(),
                        kind,
                        initialized: AtomicBool::new(false),
                    });
                    class.mark_initialized();
                    class
                })
                .clone()
        };
        self.profiler.class_prep_end(thread);
        class
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}
