use std::sync::Arc;

use crate::{
    AllocFlags, AllocSite, Allocator, ExecutionState, Frame, Module,
    RegisterFile, ThreadProxy, ThreadShared, Throwable, ThrowableKind, VMProxy,
    VMShared,
    bytecode::{Instruction, Op, decode_at},
    profile::AllocStats,
};

/// Executes bytecode for one VM thread. Frames and register files belong to
/// this interpreter alone; everything shared goes through `vm`.
#[derive(Debug)]
pub struct Interpreter {
    pub vm: VMProxy,
    pub thread: ThreadProxy,
    pub state: ExecutionState,
}

/// What the dispatch loop does after a handler completed.
#[derive(Debug)]
enum Step {
    /// fall through to the next instruction
    Next(usize),
    Jump(usize),
    Invoke(Frame),
    Return(u64),
}

impl Interpreter {
    pub fn new(vm: VMProxy, thread: ThreadProxy, state: ExecutionState) -> Self {
        Self { vm, thread, state }
    }

    /// Run method `method_idx` of `module` to completion.
    ///
    /// Returns the method's result, or the exception that escaped it. Frames
    /// pushed by this call are gone either way.
    pub fn invoke(
        &mut self,
        module: &Arc<Module>,
        method_idx: u16,
        args: &[u64],
    ) -> Result<u64, Throwable> {
        let method = module.method(method_idx).ok_or_else(|| {
            Throwable::verify_error(format!("no method {method_idx} in module"))
        })?;
        if args.len() != method.ins as usize {
            return Err(Throwable::verify_error(format!(
                "{} takes {} arguments, got {}",
                method.name,
                method.ins,
                args.len()
            )));
        }

        let id = method.id;
        let mut frame = Frame::new(module.clone(), method.clone());
        frame.registers.load_args(args)?;
        let base = self.state.depth();
        self.state.push(frame)?;
        self.vm.profiler.method_enter(self.thread.id, id);
        self.run(base)
    }

    fn run(&mut self, base: usize) -> Result<u64, Throwable> {
        loop {
            match self.step() {
                Ok(Step::Next(width)) => {
                    if let Some(frame) = self.state.current() {
                        frame.pc += width;
                    }
                }
                Ok(Step::Jump(target)) => {
                    if let Some(frame) = self.state.current() {
                        frame.pc = target;
                    }
                }
                Ok(Step::Invoke(callee)) => {
                    let id = callee.method.id;
                    match self.state.push(callee) {
                        Ok(()) => self.vm.profiler.method_enter(self.thread.id, id),
                        Err(throwable) => self.unwind(throwable, base)?,
                    }
                }
                Ok(Step::Return(value)) => {
                    if let Some(frame) = self.state.pop() {
                        self.vm.profiler.method_exit(self.thread.id, frame.method.id);
                    }
                    if self.state.depth() <= base {
                        return Ok(value);
                    }
                    self.state.retval = value;
                    // the caller is still parked on its invoke
                    if let Some(caller) = self.state.current() {
                        caller.pc += Op::InvokeStaticRange.width();
                    }
                }
                Err(throwable) => self.unwind(throwable, base)?,
            }
        }
    }

    /// Find a handler for `throwable`, popping frames above `base` that have
    /// none. Fails with the throwable once every such frame is gone.
    fn unwind(&mut self, throwable: Throwable, base: usize) -> Result<(), Throwable> {
        while self.state.depth() > base {
            let Some(frame) = self.state.current() else {
                break;
            };
            if let Some(handler) = frame.method.find_catch(frame.pc, throwable.kind) {
                log::debug!(
                    "{} caught in {} at {}",
                    throwable,
                    frame.method.name,
                    frame.pc
                );
                frame.pc = handler;
                self.state.exception = Some(throwable);
                return Ok(());
            }
            let method = frame.method.id;
            self.state.pop();
            self.vm.profiler.method_unwind(self.thread.id, method);
        }
        Err(throwable)
    }

    fn step(&mut self) -> Result<Step, Throwable> {
        let Self { vm, thread, state } = self;
        let frame = state
            .frames
            .last_mut()
            .ok_or_else(|| Throwable::verify_error("no frame to execute"))?;
        let instr = decode_at(&frame.method.code, frame.pc)
            .map_err(|err| Throwable::verify_error(err.to_string()))?;
        vm.profiler.count_instruction(instr.op());
        log::trace!("{}@{:>4}: {instr}", frame.method.name, frame.pc);

        let next = Step::Next(instr.width());
        let regs = &mut frame.registers;
        match instr {
            Instruction::Nop => {}
            Instruction::Move { dst, src } => {
                let value = regs.get(src as usize)?;
                regs.set(dst as usize, value)?;
            }
            Instruction::MoveResult { dst } => {
                regs.set(dst as usize, state.retval)?;
            }
            Instruction::MoveException { dst } => {
                let kind = state
                    .exception
                    .as_ref()
                    .map(|t| t.kind)
                    .ok_or_else(|| Throwable::verify_error("no exception to move"))?;
                regs.set(dst as usize, kind as u64)?;
                state.exception = None;
            }
            Instruction::ReturnVoid => return Ok(Step::Return(0)),
            Instruction::Return { src } => return Ok(Step::Return(regs.get(src as usize)?)),
            Instruction::Const { dst, value } => {
                regs.set_i32(dst as usize, value)?;
            }
            Instruction::ArrayLength { dst, array } => {
                let array = regs
                    .get_ref(array as usize)?
                    .ok_or_else(Throwable::null_pointer)?;
                let length = vm.heap.array_length(array)?;
                regs.set_i32(dst as usize, length as i32)?;
            }
            Instruction::NewArray {
                dst,
                length,
                class_idx,
            } => {
                op_new_array(vm, thread, &frame.module, regs, dst, length, class_idx)?;
            }
            Instruction::ThrowNew { kind } => {
                let throwable = ThrowableKind::from_u8(kind)
                    .map(Throwable::new)
                    .unwrap_or_else(|| {
                        Throwable::verify_error(format!("unknown throwable kind {kind}"))
                    });
                return Err(throwable);
            }
            Instruction::Goto { offset } => {
                return jump(frame.pc, offset as isize, frame.method.code.len());
            }
            Instruction::IfEqz { src, offset } => {
                if regs.get_i32(src as usize)? == 0 {
                    return jump(frame.pc, offset as isize, frame.method.code.len());
                }
            }
            Instruction::AGet { dst, array, index } => {
                let array = regs
                    .get_ref(array as usize)?
                    .ok_or_else(Throwable::null_pointer)?;
                let index = regs.get_i32(index as usize)?;
                let value = vm.heap.array_get(array, index)?;
                regs.set(dst as usize, value)?;
            }
            Instruction::APut { src, array, index } => {
                let value = regs.get(src as usize)?;
                let array = regs
                    .get_ref(array as usize)?
                    .ok_or_else(Throwable::null_pointer)?;
                let index = regs.get_i32(index as usize)?;
                vm.heap.array_put(array, index, value)?;
            }
            Instruction::AddInt { dst, lhs, rhs } => {
                let sum = regs
                    .get_i32(lhs as usize)?
                    .wrapping_add(regs.get_i32(rhs as usize)?);
                regs.set_i32(dst as usize, sum)?;
            }
            Instruction::InvokeStaticRange {
                count,
                method_idx,
                first,
            } => {
                let callee = frame.module.method(method_idx).ok_or_else(|| {
                    Throwable::verify_error(format!("no method {method_idx} in module"))
                })?;
                if count as u16 != callee.ins {
                    return Err(Throwable::verify_error(format!(
                        "{} takes {} arguments, got {count}",
                        callee.name, callee.ins
                    )));
                }
                let args = regs.range(first as usize, count as usize)?;
                let mut callee_frame = Frame::new(frame.module.clone(), callee.clone());
                callee_frame.registers.load_args(args)?;
                return Ok(Step::Invoke(callee_frame));
            }
        }
        Ok(next)
    }

    pub fn alloc_site(&self) -> AllocSite<'_> {
        AllocSite {
            thread: self.thread.id,
            profile: &self.thread.alloc,
        }
    }

    /// Start counting allocations made by this thread.
    pub fn start_alloc_counting(&self) {
        self.thread.start_alloc_counting();
    }

    pub fn stop_alloc_counting(&self) -> AllocStats {
        self.thread.stop_alloc_counting()
    }

    /// Run a collection pass on behalf of this thread.
    pub fn collect_garbage(&self) -> usize {
        self.vm.heap.collect(self.thread.id, &self.thread.alloc)
    }

    /// Detach the thread from the VM. Later trace keys no longer name it.
    pub fn detach(self) {
        self.vm.threads.detach(&self.thread);
    }
}

fn jump(pc: usize, offset: isize, len: usize) -> Result<Step, Throwable> {
    pc.checked_add_signed(offset)
        .filter(|&target| target < len)
        .map(Step::Jump)
        .ok_or_else(|| {
            Throwable::verify_error(format!("branch at {pc} by {offset} leaves the method"))
        })
}

/// `new-array vA, vB, class@CCCC`: allocate an array of `vB` elements of the
/// array class at pool index `CCCC` and store it in `vA`.
fn op_new_array(
    vm: &VMShared,
    thread: &ThreadShared,
    module: &Module,
    regs: &mut RegisterFile,
    dst: u8,
    length: u8,
    class_idx: u16,
) -> Result<(), Throwable> {
    let length = regs.get_i32(length as usize)?;
    log::trace!("new-array v{dst}: {length} of class@{class_idx:#06x}");
    if length < 0 {
        return Err(Throwable::negative_array_size(length));
    }

    let class = match module.pool.resolved_class(class_idx) {
        Some(class) => class,
        None => vm.classes.resolve_class(&module.pool, class_idx, thread.id)?,
    };
    debug_assert!(class.is_array(), "new-array on {}", class.descriptor);
    debug_assert!(class.is_initialized());

    let site = AllocSite {
        thread: thread.id,
        profile: &thread.alloc,
    };
    let array = vm
        .heap
        .alloc_array_by_class(&class, length as usize, AllocFlags::DONT_TRACK, site)?;
    regs.set_ref(dst as usize, Some(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CatchEntry, ExecutionStateCreateInfo, HeapCreateInfo, MethodDef,
        ModuleDef, ObjectRef, ThreadId, VM, VMCreateInfo,
        bytecode::CodeBuilder,
        profile::{
            MethodAction, ProfilerCreateInfo, TraceFile, TraceFlags, TraceTarget,
        },
    };
    use std::{collections::HashMap, io::Write, thread};

    #[derive(Clone, Default)]
    struct Sink(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn vm_with_heap(size: usize) -> VM {
        VM::new(VMCreateInfo {
            heap: HeapCreateInfo {
                size,
                header_size: None,
                external_limit: None,
            },
            profiler: ProfilerCreateInfo::default(),
        })
    }

    fn vm() -> VM {
        vm_with_heap(1 << 20)
    }

    fn method(name: &str, registers: u16, ins: u16, code: CodeBuilder) -> MethodDef {
        MethodDef {
            class: "LDemo;".into(),
            name: name.into(),
            signature: "()I".into(),
            registers,
            ins,
            code: code.into_units(),
            catches: Vec::new(),
        }
    }

    fn int_arg(value: i32) -> u64 {
        value as i64 as u64
    }

    /// `(len) -> new int[len]`
    fn alloc_module(vm: &VM, class: &str) -> Arc<Module> {
        let mut b = CodeBuilder::new();
        b.new_array(0, 1, 0);
        b.return_(0);
        vm.shared().load_module(ModuleDef {
            class_refs: vec![class.into()],
            methods: vec![method("alloc", 2, 1, b)],
        })
    }

    fn start_trace(vm: &VM) -> Sink {
        let sink = Sink::default();
        vm.profiler()
            .start_method_tracing(
                TraceTarget::Writer(Box::new(sink.clone())),
                1 << 16,
                TraceFlags::empty(),
            )
            .unwrap();
        sink
    }

    fn stop_trace(vm: &VM, sink: &Sink) -> TraceFile {
        vm.profiler().stop_method_tracing(vm.shared()).unwrap();
        TraceFile::parse(&sink.0.lock()).unwrap()
    }

    #[test]
    fn new_array_has_exact_length_and_type() {
        let vm = vm();
        let module = alloc_module(&vm, "[I");
        let mut interp = vm.new_proxy().attach_thread("main");

        let raw = interp.invoke(&module, 0, &[int_arg(5)]).unwrap();
        let array = ObjectRef::from_raw(raw).unwrap();
        let heap = &vm.shared().heap;
        assert_eq!(heap.array_length(array).unwrap(), 5);
        assert_eq!(heap.class_of(array).unwrap().descriptor, "[I");
        assert!(!heap.is_tracked(array));
        assert!(module.pool.resolved_class(0).is_some());

        let empty = interp.invoke(&module, 0, &[0]).unwrap();
        assert_eq!(heap.array_length(ObjectRef::from_raw(empty).unwrap()).unwrap(), 0);
        assert_eq!(interp.state.depth(), 0);
    }

    #[test]
    fn negative_length_leaves_destination_untouched() {
        let vm = vm();
        let mut b = CodeBuilder::new();
        b.const_(0, 1234);
        let guarded = b.current_offset();
        b.new_array(0, 2, 0);
        let handler = b.current_offset();
        b.return_(0);
        let mut guarded_def = method("guarded", 3, 1, b);
        guarded_def.catches = vec![CatchEntry {
            start: guarded as u32,
            end: handler as u32,
            handler: handler as u32,
            kind: Some(ThrowableKind::NegativeArraySize),
        }];

        let mut b = CodeBuilder::new();
        b.new_array(0, 1, 0);
        b.return_(0);
        let module = vm.shared().load_module(ModuleDef {
            class_refs: vec!["[I".into()],
            methods: vec![guarded_def, method("bare", 2, 1, b)],
        });
        let mut interp = vm.new_proxy().attach_thread("main");

        assert_eq!(interp.invoke(&module, 0, &[int_arg(-1)]).unwrap(), 1234);
        let err = interp.invoke(&module, 1, &[int_arg(-7)]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::NegativeArraySize);
        assert_eq!(err.message.as_deref(), Some("-7"));
        assert_eq!(vm.shared().heap.object_count(), 0);
        assert!(
            module.pool.resolved_class(0).is_none(),
            "class is not resolved before the length check"
        );
    }

    #[test]
    fn unresolvable_class_throws() {
        let vm = vm();
        let module = alloc_module(&vm, "[LMissing;");
        let mut interp = vm.new_proxy().attach_thread("main");

        let err = interp.invoke(&module, 0, &[int_arg(3)]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::NoClassDefFound);
        assert!(module.pool.resolved_class(0).is_none());
        assert_eq!(vm.shared().heap.object_count(), 0);
    }

    #[test]
    fn exhaustion_throws_out_of_memory() {
        let vm = vm_with_heap(256);
        let module = alloc_module(&vm, "[J");
        let mut interp = vm.new_proxy().attach_thread("main");
        interp.start_alloc_counting();

        let err = interp.invoke(&module, 0, &[int_arg(100)]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::OutOfMemory);
        let stats = interp.stop_alloc_counting();
        assert_eq!(stats.alloc_count, 0);
        assert_eq!(stats.failed_alloc_count, 1);
        assert_eq!(stats.failed_alloc_size, 16 + 800);
        assert_eq!(stats.gc_count, 1);
    }

    #[test]
    fn alloc_counters_match_work_done() {
        let vm = vm_with_heap(2048);
        let module = alloc_module(&vm, "[B");
        let mut interp = vm.new_proxy().attach_thread("main");
        vm.profiler().start_alloc_counting();
        interp.start_alloc_counting();

        let lengths = [0, 1, 10, 100];
        for len in lengths {
            interp.invoke(&module, 0, &[int_arg(len)]).unwrap();
        }
        // does not fit: 16 + 4000 bytes
        interp.invoke(&module, 0, &[int_arg(4000)]).unwrap_err();

        let local = interp.stop_alloc_counting();
        let global = vm.profiler().stop_alloc_counting();
        let expected_size = lengths.iter().map(|&n| 16 + n as u64).sum::<u64>();
        for stats in [local, global] {
            assert_eq!(stats.alloc_count, lengths.len() as u64);
            assert_eq!(stats.alloc_size, expected_size);
            assert_eq!(stats.failed_alloc_count, 1);
            assert_eq!(stats.failed_alloc_size, 4016);
            assert_eq!(stats.gc_count, 1);
        }
    }

    #[test]
    fn counting_loop() {
        let vm = vm();
        // v2 counts down from the argument, v0 accumulates
        let mut b = CodeBuilder::new();
        b.const_(0, 0);
        b.const_(1, -1);
        let top = b.current_offset();
        let done = b.if_eqz(2);
        b.add_int(0, 0, 2);
        b.add_int(2, 2, 1);
        b.goto_back(top);
        b.bind(done);
        b.return_(0);
        let module = vm.shared().load_module(ModuleDef {
            class_refs: Vec::new(),
            methods: vec![method("sum", 3, 1, b)],
        });
        let mut interp = vm.new_proxy().attach_thread("main");

        vm.profiler().start_instruction_counting();
        assert_eq!(interp.invoke(&module, 0, &[int_arg(10)]).unwrap(), 55);
        vm.profiler().stop_instruction_counting().unwrap();

        let counts = vm.profiler().instruction_counts();
        assert_eq!(counts[Op::AddInt as usize], 20);
        assert_eq!(counts[Op::IfEqz as usize], 11);
        assert_eq!(counts[Op::Goto as usize], 10);
        assert_eq!(counts[Op::Return as usize], 1);
    }

    #[test]
    fn calls_pass_arguments_and_results() {
        let vm = vm();
        // main: v0 = 40, v1 = 2, add(v0, v1), v2 = result + result
        let mut b = CodeBuilder::new();
        b.const_(0, 40);
        b.const_(1, 2);
        b.invoke_static_range(1, 0, 2);
        b.move_result(2);
        b.add_int(2, 2, 2);
        b.return_(2);
        let main = method("main", 3, 0, b);

        let mut b = CodeBuilder::new();
        b.add_int(0, 1, 2);
        b.return_(0);
        let add = method("add", 3, 2, b);

        let module = vm.shared().load_module(ModuleDef {
            class_refs: Vec::new(),
            methods: vec![main, add],
        });
        let mut interp = vm.new_proxy().attach_thread("main");
        assert_eq!(interp.invoke(&module, 0, &[]).unwrap(), 84);

        let err = interp.invoke(&module, 1, &[1]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::VerifyError);
    }

    #[test]
    fn arrays_round_trip_through_registers() {
        let vm = vm();
        let mut b = CodeBuilder::new();
        b.const_(1, 4);
        b.new_array(0, 1, 0);
        b.const_(2, 3);
        b.const_(3, 99);
        b.aput(3, 0, 2);
        b.aget(4, 0, 2);
        b.return_(4);
        let store = method("store", 5, 0, b);

        let mut b = CodeBuilder::new();
        b.const_(0, 0);
        b.array_length(1, 0);
        b.return_(1);
        let null_length = method("null_length", 2, 0, b);

        let mut b = CodeBuilder::new();
        b.const_(1, 2);
        b.new_array(0, 1, 0);
        b.aget(2, 0, 1);
        b.return_(2);
        let out_of_bounds = method("out_of_bounds", 3, 0, b);

        let module = vm.shared().load_module(ModuleDef {
            class_refs: vec!["[I".into()],
            methods: vec![store, null_length, out_of_bounds],
        });
        let mut interp = vm.new_proxy().attach_thread("main");

        assert_eq!(interp.invoke(&module, 0, &[]).unwrap(), 99);
        let err = interp.invoke(&module, 1, &[]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::NullPointer);
        let err = interp.invoke(&module, 2, &[]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::ArrayIndexOutOfBounds);
        assert_eq!(err.message.as_deref(), Some("length=2; index=2"));
    }

    #[test]
    fn unwinding_is_traced_and_caught_by_the_caller() {
        let vm = vm();
        let mut b = CodeBuilder::new();
        b.invoke_static_range(1, 0, 0);
        let handler = b.current_offset();
        b.move_exception(0);
        b.return_(0);
        let mut main = method("main", 1, 0, b);
        main.catches = vec![CatchEntry {
            start: 0,
            end: handler as u32,
            handler: handler as u32,
            kind: None,
        }];

        let mut b = CodeBuilder::new();
        b.throw_new(ThrowableKind::NullPointer as u8);
        let thrower = method("thrower", 0, 0, b);

        let module = vm.shared().load_module(ModuleDef {
            class_refs: Vec::new(),
            methods: vec![main, thrower],
        });
        let mut interp = vm.new_proxy().attach_thread("main");

        let sink = start_trace(&vm);
        let code = interp.invoke(&module, 0, &[]).unwrap();
        assert_eq!(code, ThrowableKind::NullPointer as u64);
        assert!(interp.state.exception.is_none());
        let file = stop_trace(&vm, &sink);

        let main_id = module.methods[0].id;
        let thrower_id = module.methods[1].id;
        let events = file
            .records
            .iter()
            .map(|r| (r.method, r.action))
            .collect::<Vec<_>>();
        assert_eq!(events, vec![
            (main_id, MethodAction::Enter),
            (thrower_id, MethodAction::Enter),
            (thrower_id, MethodAction::Unwind),
            (main_id, MethodAction::Exit),
        ]);
        assert_eq!(file.method(thrower_id).unwrap().name, "thrower");
        assert_eq!(file.threads[0].name, "main");
    }

    #[test]
    fn uncaught_exceptions_unwind_every_frame() {
        let vm = vm();
        let mut b = CodeBuilder::new();
        b.invoke_static_range(1, 0, 0);
        b.return_void();
        let outer = method("outer", 0, 0, b);
        let mut b = CodeBuilder::new();
        b.throw_new(ThrowableKind::RuntimeException as u8);
        let inner = method("inner", 0, 0, b);
        let module = vm.shared().load_module(ModuleDef {
            class_refs: Vec::new(),
            methods: vec![outer, inner],
        });
        let mut interp = vm.new_proxy().attach_thread("main");

        let sink = start_trace(&vm);
        let err = interp.invoke(&module, 0, &[]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::RuntimeException);
        assert_eq!(interp.state.depth(), 0);

        let file = stop_trace(&vm, &sink);
        let actions = file.records.iter().map(|r| r.action).collect::<Vec<_>>();
        assert_eq!(actions, vec![
            MethodAction::Enter,
            MethodAction::Enter,
            MethodAction::Unwind,
            MethodAction::Unwind,
        ]);
    }

    #[test]
    fn runaway_recursion_overflows() {
        let vm = vm();
        let mut b = CodeBuilder::new();
        b.invoke_static_range(0, 0, 0);
        b.return_void();
        let module = vm.shared().load_module(ModuleDef {
            class_refs: Vec::new(),
            methods: vec![method("recurse", 0, 0, b)],
        });
        let mut interp = vm
            .new_proxy()
            .attach_thread_with("main", &ExecutionStateCreateInfo { max_frames: 16 });

        let err = interp.invoke(&module, 0, &[]).unwrap_err();
        assert_eq!(err.kind, ThrowableKind::StackOverflow);
        assert_eq!(interp.state.depth(), 0);
    }

    #[test]
    fn malformed_code_is_a_verify_error() {
        let vm = vm();
        let mut falls_off = CodeBuilder::new();
        falls_off.nop();
        let module = vm.shared().load_module(ModuleDef {
            class_refs: Vec::new(),
            methods: vec![
                method("falls_off", 0, 0, falls_off),
                MethodDef {
                    code: vec![0x00ff],
                    ..method("garbage", 0, 0, CodeBuilder::new())
                },
                // goto +5 in a one unit method
                MethodDef {
                    code: vec![0x0528],
                    ..method("bad_branch", 0, 0, CodeBuilder::new())
                },
            ],
        });
        let mut interp = vm.new_proxy().attach_thread("main");
        for idx in 0..3 {
            let err = interp.invoke(&module, idx, &[]).unwrap_err();
            assert_eq!(err.kind, ThrowableKind::VerifyError);
        }
        assert_eq!(interp.state.depth(), 0);
    }

    #[test]
    fn threads_trace_concurrently_with_paired_events() {
        const THREADS: usize = 4;
        const CALLS: usize = 200;

        let vm = vm_with_heap(64 << 20);
        let mut b = CodeBuilder::new();
        b.invoke_static_range(1, 0, 1);
        b.move_result(0);
        b.return_(0);
        let outer = method("outer", 1, 1, b);
        let mut b = CodeBuilder::new();
        b.new_array(0, 1, 0);
        b.array_length(0, 0);
        b.return_(0);
        let inner = method("inner", 2, 1, b);
        let module = vm.shared().load_module(ModuleDef {
            class_refs: vec!["[I".into()],
            methods: vec![outer, inner],
        });

        // prepare the array class up front so no class-prep events show up
        vm.shared().classes.find_class("[I", ThreadId(1)).unwrap();

        let sink = start_trace(&vm);
        thread::scope(|s| {
            for t in 0..THREADS {
                let proxy = vm.new_proxy();
                let module = module.clone();
                s.spawn(move || {
                    let mut interp = proxy.attach_thread(&format!("worker-{t}"));
                    for n in 0..CALLS {
                        let len = interp.invoke(&module, 0, &[n as u64]).unwrap();
                        assert_eq!(len, n as u64);
                    }
                });
            }
        });
        let file = stop_trace(&vm, &sink);
        assert_eq!(file.threads.len(), THREADS);

        // 4 events per call; the buffer holds all of them
        let total = file.records.len() as u32 + file.header.overflow;
        assert_eq!(total as usize, THREADS * CALLS * 4);
        assert_eq!(file.header.overflow, 0);

        let mut stacks: HashMap<ThreadId, Vec<_>> = HashMap::new();
        for record in &file.records {
            let stack = stacks.entry(record.thread).or_default();
            match record.action {
                MethodAction::Enter => stack.push(record.method),
                MethodAction::Exit | MethodAction::Unwind => {
                    assert_eq!(stack.pop(), Some(record.method));
                }
            }
        }
        assert!(stacks.values().all(Vec::is_empty));
    }
}
