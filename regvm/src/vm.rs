use std::{marker::PhantomData, ops::Deref, sync::Arc};

use crate::{
    ClassLinker, ConstantPool, ExecutionState, ExecutionStateCreateInfo, Heap,
    HeapCreateInfo, Interpreter, MethodId, MethodTable, Module, ModuleDef,
    Profiler, ThreadList, ThreadState,
    profile::{MethodEntry, ProfilerCreateInfo, ThreadEntry, TraceKey},
};

#[derive(Debug)]
pub struct VMShared {
    pub profiler: Arc<Profiler>,
    pub heap: Heap,
    pub classes: ClassLinker,
    pub threads: ThreadList,
    pub methods: MethodTable,
}

#[allow(unused)]
pub struct VM {
    inner: Arc<VMShared>,
    _marker: PhantomData<*const ()>,
}

/// Handle to the shared VM state that can be sent to other threads.
#[derive(Debug, Clone)]
pub struct VMProxy {
    pub shared: Arc<VMShared>,
}

impl Deref for VMProxy {
    type Target = VMShared;

    fn deref(&self) -> &Self::Target {
        &self.shared
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VMCreateInfo {
    pub heap: HeapCreateInfo,
    pub profiler: ProfilerCreateInfo,
}

impl VM {
    pub fn new(info: VMCreateInfo) -> Self {
        let profiler = Arc::new(Profiler::startup(info.profiler));
        let inner = VMShared {
            heap: Heap::new(info.heap, profiler.clone()),
            classes: ClassLinker::new(profiler.clone()),
            threads: ThreadList::new(),
            methods: MethodTable::new(),
            profiler,
        };
        log::info!("vm created: heap limit {} bytes", inner.heap.limit());

        Self {
            inner: Arc::new(inner),
            _marker: PhantomData,
        }
    }

    pub fn new_proxy(&self) -> VMProxy {
        VMProxy {
            shared: self.inner.clone(),
        }
    }

    pub fn profiler(&self) -> &Profiler {
        &self.inner.profiler
    }

    pub fn shared(&self) -> &VMShared {
        &self.inner
    }

    /// Stop any profiling still running; a pending method trace is written.
    pub fn shutdown(&self) {
        self.inner.profiler.shutdown(&*self.inner);
        log::info!("vm shut down");
    }
}

impl VMShared {
    /// Give every method of `def` an id and make it callable.
    pub fn load_module(&self, def: ModuleDef) -> Arc<Module> {
        let methods = def
            .methods
            .into_iter()
            .map(|method| self.methods.register(method))
            .collect::<Vec<_>>();
        log::debug!(
            "loaded module: {} methods, {} class refs",
            methods.len(),
            def.class_refs.len()
        );
        Arc::new(Module {
            pool: ConstantPool::new(def.class_refs),
            methods: methods.into_boxed_slice(),
        })
    }
}

impl VMProxy {
    /// Attach a new VM thread and build its interpreter.
    pub fn attach_thread(&self, name: &str) -> Interpreter {
        self.attach_thread_with(name, &ExecutionStateCreateInfo::default())
    }

    pub fn attach_thread_with(
        &self,
        name: &str,
        info: &ExecutionStateCreateInfo,
    ) -> Interpreter {
        let track_external = self.profiler.settings().track_external_allocations;
        let thread = self.threads.attach(name, track_external);
        thread.set_state(ThreadState::Running);
        Interpreter::new(self.clone(), thread, ExecutionState::new(info))
    }
}

impl TraceKey for VMShared {
    fn method_entry(&self, id: MethodId) -> Option<MethodEntry> {
        self.methods.get(id).map(|method| method.entry())
    }

    fn threads(&self) -> Vec<ThreadEntry> {
        self.threads.entries()
    }
}
