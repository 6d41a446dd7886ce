use std::{hint::black_box, io, sync::Arc};

use criterion::{Criterion, criterion_group, criterion_main};
use regvm::{
    HeapCreateInfo, Interpreter, MethodDef, Module, ModuleDef, TraceFlags,
    TraceTarget, VM, VMCreateInfo, bytecode::CodeBuilder,
};

const ITERATIONS: u64 = 1000;

/// Discards everything, so the bench measures recording and not the disk.
struct Discard;

impl io::Write for Discard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// count(n) calls leaf() n times.
fn module() -> ModuleDef {
    let mut b = CodeBuilder::new();
    b.const_(0, 0);
    b.const_(1, -1);
    let top = b.current_offset();
    let done = b.if_eqz(2);
    b.invoke_static_range(1, 0, 0);
    b.add_int(2, 2, 1);
    b.goto_back(top);
    b.bind(done);
    b.return_(0);
    let count = MethodDef {
        class: "LBench;".into(),
        name: "count".into(),
        signature: "(I)I".into(),
        registers: 3,
        ins: 1,
        code: b.into_units(),
        ..Default::default()
    };

    let mut b = CodeBuilder::new();
    b.const_(0, 4);
    b.return_void();
    let leaf = MethodDef {
        class: "LBench;".into(),
        name: "leaf".into(),
        signature: "()V".into(),
        registers: 1,
        code: b.into_units(),
        ..Default::default()
    };

    ModuleDef {
        class_refs: Vec::new(),
        methods: vec![count, leaf],
    }
}

fn setup() -> (VM, Arc<Module>, Interpreter) {
    let vm = VM::new(VMCreateInfo {
        heap: HeapCreateInfo {
            size: 1 << 20,
            header_size: None,
            external_limit: None,
        },
        profiler: Default::default(),
    });
    let module = vm.shared().load_module(module());
    let interp = vm.new_proxy().attach_thread("bench");
    (vm, module, interp)
}

fn bench_idle(c: &mut Criterion) {
    let (_vm, module, mut interp) = setup();
    c.bench_function("calls_1000_idle", |b| {
        b.iter(|| {
            interp
                .invoke(&module, 0, &[black_box(ITERATIONS)])
                .expect("Benchmark failed")
        });
    });
}

fn bench_traced(c: &mut Criterion) {
    let (vm, module, mut interp) = setup();
    let profiler = vm.profiler();
    c.bench_function("calls_1000_traced", |b| {
        b.iter(|| {
            profiler
                .start_method_tracing(
                    TraceTarget::Writer(Box::new(Discard)),
                    64 * 1024,
                    TraceFlags::empty(),
                )
                .expect("trace start failed");
            interp
                .invoke(&module, 0, &[black_box(ITERATIONS)])
                .expect("Benchmark failed");
            profiler
                .stop_method_tracing(vm.shared())
                .expect("trace stop failed")
        });
    });
}

fn bench_counted(c: &mut Criterion) {
    let (vm, module, mut interp) = setup();
    vm.profiler().start_instruction_counting();
    c.bench_function("calls_1000_counted", |b| {
        b.iter(|| {
            interp
                .invoke(&module, 0, &[black_box(ITERATIONS)])
                .expect("Benchmark failed")
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_idle, bench_traced, bench_counted
}

criterion_main!(benches);
