mod allocator;
pub mod bytecode;
mod class;
mod exception;
mod execution;
mod heap;
mod interpreter;
mod method;
pub mod profile;
mod registers;
mod threads;
mod vm;

pub use allocator::{AllocFlags, AllocSite, Allocator, ObjectLayout};
pub use class::{
    Class, ClassHandle, ClassKind, ClassLinker, ComponentType, ConstantPool,
};
pub use exception::{Throwable, ThrowableKind};
pub use execution::{ExecutionState, ExecutionStateCreateInfo, Frame};
pub use heap::{Heap, HeapCreateInfo, HeapSettings, ObjectRef};
pub use interpreter::Interpreter;
pub use method::{
    CatchEntry, Method, MethodDef, MethodId, MethodTable, Module, ModuleDef,
};
pub use profile::{Profiler, TraceError, TraceFlags, TraceTarget};
pub use registers::RegisterFile;
pub use threads::{
    ThreadId, ThreadInfo, ThreadList, ThreadProxy, ThreadShared, ThreadState,
};
pub use vm::*;
