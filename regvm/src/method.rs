use std::{fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{ConstantPool, ThrowableKind, profile::MethodEntry};

/// Process-wide method identifier. The two low bits are always clear so the
/// trace recorder can pack an action into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u32);

impl MethodId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_index(index: u32) -> Self {
        Self(index << 2)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 >> 2
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A try range: exceptions raised at `start <= pc < end` land in `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// `None` catches everything.
    pub kind: Option<ThrowableKind>,
}

impl CatchEntry {
    pub fn covers(&self, pc: usize, kind: ThrowableKind) -> bool {
        (self.start as usize..self.end as usize).contains(&pc)
            && self.kind.is_none_or(|k| k == kind)
    }
}

#[derive(Debug)]
pub struct Method {
    pub id: MethodId,
    /// descriptor of the declaring class
    pub class: String,
    pub name: String,
    pub signature: String,
    pub registers: u16,
    /// argument count, passed in the last `ins` registers
    pub ins: u16,
    pub code: Box<[u16]>,
    pub catches: Box<[CatchEntry]>,
}

impl Method {
    /// First catch entry covering `pc` for `kind`, in declaration order.
    pub fn find_catch(&self, pc: usize, kind: ThrowableKind) -> Option<usize> {
        self.catches
            .iter()
            .find(|entry| entry.covers(pc, kind))
            .map(|entry| entry.handler as usize)
    }

    pub fn entry(&self) -> MethodEntry {
        MethodEntry {
            id: self.id,
            class: self.class.clone(),
            name: self.name.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// A method before it is given an id.
#[derive(Debug, Clone, Default)]
pub struct MethodDef {
    pub class: String,
    pub name: String,
    pub signature: String,
    pub registers: u16,
    pub ins: u16,
    pub code: Vec<u16>,
    pub catches: Vec<CatchEntry>,
}

/// A loadable unit: a class reference table and the methods whose code
/// indexes into it.
#[derive(Debug, Clone, Default)]
pub struct ModuleDef {
    pub class_refs: Vec<String>,
    pub methods: Vec<MethodDef>,
}

#[derive(Debug)]
pub struct Module {
    pub pool: ConstantPool,
    pub methods: Box<[Arc<Method>]>,
}

impl Module {
    #[inline]
    pub fn method(&self, index: u16) -> Option<&Arc<Method>> {
        self.methods.get(index as usize)
    }

    pub fn find_method(&self, name: &str) -> Option<u16> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .and_then(|idx| u16::try_from(idx).ok())
    }
}

/// Every loaded method, indexed by id.
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: RwLock<Vec<Arc<Method>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: MethodDef) -> Arc<Method> {
        let mut methods = self.methods.write();
        // index 0 is never handed out
        let id = MethodId::from_index(methods.len() as u32 + 1);
        let method = Arc::new(Method {
            id,
            class: def.class,
            name: def.name,
            signature: def.signature,
            registers: def.registers,
            ins: def.ins,
            code: def.code.into_boxed_slice(),
            catches: def.catches.into_boxed_slice(),
        });
        methods.push(method.clone());
        method
    }

    pub fn get(&self, id: MethodId) -> Option<Arc<Method>> {
        let index = (id.index() as usize).checked_sub(1)?;
        let methods = self.methods.read();
        methods.get(index).filter(|m| m.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
