use std::{collections::HashMap, fs, io, path::PathBuf, process::ExitCode, thread};

use clap::{Args, Parser, Subcommand};
use regvm::{
    CatchEntry, HeapCreateInfo, Interpreter, MethodDef, ModuleDef, Throwable,
    TraceError, TraceFlags, TraceTarget, VM, VMCreateInfo,
    bytecode::{CodeBuilder, Op},
    profile::{
        AllocStats, MethodAction, ProfilerCreateInfo, TraceFile, format::FormatError,
    },
};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "regvm", version, about = "Register bytecode VM with method tracing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the demo workload on several VM threads.
    Run(RunArgs),
    /// Print a summary of a method trace file.
    Dump {
        trace: PathBuf,
        /// also print every record
        #[arg(long)]
        records: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, default_value_t = 4)]
    threads: usize,
    /// loop iterations per thread
    #[arg(short, long, default_value_t = 1000)]
    iterations: u32,
    #[arg(long, default_value_t = 64 << 20)]
    heap_size: usize,
    /// write a method trace to this file
    #[arg(long)]
    trace: Option<PathBuf>,
    /// trace buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,
    #[arg(long)]
    alloc_counts: bool,
    #[arg(long)]
    count_instructions: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("uncaught {0}")]
    Uncaught(#[from] Throwable),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Dump { trace, records } => dump(trace, records),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// run(n): sum of fill(n), fill(n - 1), .., fill(1), then probe()
fn demo_module() -> ModuleDef {
    let method = |name: &str, signature: &str, registers, ins, b: CodeBuilder| MethodDef {
        class: "LDemo;".into(),
        name: name.into(),
        signature: signature.into(),
        registers,
        ins,
        code: b.into_units(),
        catches: Vec::new(),
    };

    // v3 = n, v0 = sum, v1 = -1
    let mut b = CodeBuilder::new();
    b.const_(0, 0);
    b.const_(1, -1);
    let top = b.current_offset();
    let done = b.if_eqz(3);
    b.invoke_static_range(1, 3, 1);
    b.move_result(2);
    b.add_int(0, 0, 2);
    b.add_int(3, 3, 1);
    b.goto_back(top);
    b.bind(done);
    b.invoke_static_range(2, 0, 0);
    b.return_(0);
    let run = method("run", "(I)I", 4, 1, b);

    // fill(n): a = new int[n]; a[0] = a.length; return a[0]
    let mut b = CodeBuilder::new();
    b.new_array(0, 3, 0);
    b.array_length(1, 0);
    b.const_(2, 0);
    b.aput(1, 0, 2);
    b.aget(1, 0, 2);
    b.return_(1);
    let fill = method("fill", "(I)I", 4, 1, b);

    // probe(): explode() under a catch-all
    let mut b = CodeBuilder::new();
    b.invoke_static_range(3, 0, 0);
    let handler = b.current_offset();
    b.move_exception(0);
    b.return_(0);
    let mut probe = method("probe", "()I", 1, 0, b);
    probe.catches.push(CatchEntry {
        start: 0,
        end: handler as u32,
        handler: handler as u32,
        kind: None,
    });

    let mut b = CodeBuilder::new();
    b.const_(0, -1);
    b.new_array(0, 0, 0);
    b.return_void();
    let explode = method("explode", "()V", 1, 0, b);

    ModuleDef {
        class_refs: vec!["[I".into()],
        methods: vec![run, fill, probe, explode],
    }
}

fn print_alloc_stats(label: &str, stats: &AllocStats) {
    println!(
        "{label}: {} allocs ({} bytes), {} failed ({} bytes), {} frees, {} gcs",
        stats.alloc_count,
        stats.alloc_size,
        stats.failed_alloc_count,
        stats.failed_alloc_size,
        stats.free_count,
        stats.gc_count
    );
}

fn run(args: RunArgs) -> Result<(), CliError> {
    let vm = VM::new(VMCreateInfo {
        heap: HeapCreateInfo {
            size: args.heap_size,
            header_size: None,
            external_limit: None,
        },
        profiler: ProfilerCreateInfo {
            buffer_size: args.buffer_size,
            ..Default::default()
        },
    });
    let profiler = vm.profiler();

    if let Some(path) = &args.trace {
        let mut flags = TraceFlags::empty();
        flags.set(TraceFlags::ALLOC_COUNTS, args.alloc_counts);
        let size = profiler.settings().buffer_size;
        profiler.start_method_tracing(TraceTarget::File(path.clone()), size, flags)?;
    } else if args.alloc_counts {
        profiler.start_alloc_counting();
    }
    if args.count_instructions {
        profiler.start_instruction_counting();
    }

    let module = vm.shared().load_module(demo_module());
    let results = thread::scope(|s| {
        let workers = (0..args.threads)
            .map(|t| {
                let proxy = vm.new_proxy();
                let module = module.clone();
                s.spawn(move || {
                    let mut interp = proxy.attach_thread(&format!("worker-{t}"));
                    interp.start_alloc_counting();
                    let result = interp.invoke(&module, 0, &[args.iterations as u64]);
                    let stats = interp.stop_alloc_counting();
                    (interp, result, stats)
                })
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .filter_map(|w| w.join().ok())
            .collect::<Vec<(Interpreter, _, _)>>()
    });

    let mut outcome = Ok(());
    for (interp, result, stats) in &results {
        let name = interp.thread.name();
        match result {
            Ok(value) => println!("{name}: result {value}"),
            Err(err) => {
                println!("{name}: {err}");
                outcome = Err(err.clone());
            }
        }
        print_alloc_stats(&name, stats);
    }

    if args.trace.is_some() {
        let summary = profiler.stop_method_tracing(vm.shared())?;
        println!(
            "trace: {} entries, {} dropped, {:?}",
            summary.entries, summary.overflow, summary.elapsed
        );
    }
    if args.alloc_counts {
        let stats = profiler.stop_alloc_counting();
        print_alloc_stats("total", &stats);
    }
    if args.count_instructions {
        profiler.stop_instruction_counting()?;
        for (byte, count) in profiler.instruction_counts().into_iter().enumerate() {
            if let Some(op) = Op::from_u8(byte as u8).filter(|_| count != 0) {
                println!("{:>20} {count}", op.name());
            }
        }
    }

    for (interp, _, _) in results {
        interp.detach();
    }
    vm.shutdown();
    outcome.map_err(CliError::from)
}

fn dump(path: PathBuf, records: bool) -> Result<(), CliError> {
    let bytes = fs::read(&path)?;
    let file = TraceFile::parse(&bytes)?;

    println!("{}", path.display());
    println!(
        "  version {}, {} entries, {} dropped{}",
        file.header.version,
        file.header.entries,
        file.header.overflow,
        if file.overflowed { " (buffer overflowed)" } else { "" }
    );
    for thread in &file.threads {
        println!("  thread {:>3} {}", thread.id.0, thread.name);
    }

    let mut calls: HashMap<_, u64> = HashMap::new();
    let mut unwinds: HashMap<_, u64> = HashMap::new();
    for record in &file.records {
        match record.action {
            MethodAction::Enter => *calls.entry(record.method).or_default() += 1,
            MethodAction::Unwind => *unwinds.entry(record.method).or_default() += 1,
            MethodAction::Exit => {}
        }
    }
    let mut by_calls = calls.into_iter().collect::<Vec<_>>();
    by_calls.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (id, count) in by_calls {
        let unwound = unwinds.get(&id).copied().unwrap_or(0);
        match file.method(id) {
            Some(m) => println!(
                "  {count:>10} calls {unwound:>6} unwound  {}.{}{}",
                m.class, m.name, m.signature
            ),
            None => println!("  {count:>10} calls {unwound:>6} unwound  {id}"),
        }
    }

    if records {
        for r in &file.records {
            let action = match r.action {
                MethodAction::Enter => "enter",
                MethodAction::Exit => "exit",
                MethodAction::Unwind => "unwind",
            };
            let name = file.method(r.method).map_or("?", |m| m.name.as_str());
            println!("  {:>10}us t{:<3} {action:<6} {name}", r.elapsed_usec, r.thread.0);
        }
    }

    if file.header.overflow != 0 {
        log::warn!("{} events were dropped", file.header.overflow);
    }
    Ok(())
}
