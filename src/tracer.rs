//! The memory tracer: registers the operation catalog with the engine,
//! turns observer callbacks into trace records and statistics, and
//! drives a whole run from launch/attach to the saved summary.

use std::io::{self, Write};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use log::warn;
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::arch::Registers;
use crate::catalog::{CallbackRegistry, FunctionSpec, Operation, SyscallSpec, OPERATION_COUNT};
use crate::command::Command;
use crate::config::{Args, Config};
use crate::engine::Engine;
use crate::loader;
use crate::observer::Observer;
use crate::recorder::{create_compressed_sink, RecorderConfig, TraceRecorder};
use crate::stats::StatInfo;
use crate::unwind::Arena;

/// Everything the observer callbacks touch, shared between the engine's
/// supervisor threads and the run driver.
struct Shared {
    recorder: TraceRecorder,
    invoke_counts: [AtomicU64; OPERATION_COUNT],
    result_counts: [AtomicU64; OPERATION_COUNT],
    max_stack_depth: AtomicI32,
    relations: Mutex<Vec<(i32, i32)>>,
    collect_trace: bool,
}

impl Shared {
    fn new(recorder: TraceRecorder, collect_trace: bool) -> Self {
        Self {
            recorder,
            invoke_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            result_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            max_stack_depth: AtomicI32::new(-1),
            relations: Mutex::new(Vec::new()),
            collect_trace,
        }
    }

    fn invoke(&self, op: Operation, tid: Pid, regs: &Registers, arena: &mut Arena) {
        self.invoke_counts[op.index() as usize].fetch_add(1, Ordering::Relaxed);
        if !self.collect_trace {
            return;
        }
        let depth = self
            .recorder
            .record(op.invoke_tag(), tid, invoke_args(op, regs), arena);
        self.max_stack_depth
            .fetch_max(depth as i32, Ordering::Relaxed);
    }

    fn result(&self, op: Operation, tid: Pid, regs: &Registers, arena: &mut Arena) {
        self.result_counts[op.index() as usize].fetch_add(1, Ordering::Relaxed);
        if !self.collect_trace {
            return;
        }
        self.recorder
            .record(op.result_tag(), tid, [result_value(op, regs), 0], arena);
    }
}

/// Argument registers recorded for an invocation, by operation.
fn invoke_args(op: Operation, regs: &Registers) -> [u64; 2] {
    use Operation::*;
    let r = regs.current();
    match op {
        Unknown | Fork | Vfork => [0, 0],
        Brk | Sbrk | Clone | Clone3 | Free | Malloc | Valloc | New | DeleteLegacy
        | DeleteArray => [r.rdi, 0],
        Mmap | Munmap | Execve | Calloc | Realloc | AlignedAlloc | NewArray | Delete => {
            [r.rdi, r.rsi]
        }
        // posix_memalign(&ptr, alignment, size): record size, alignment
        PosixMemalign => [r.rdx, r.rsi],
    }
}

/// Value recorded for a result. posix_memalign reports through its
/// out-pointer rather than rax.
fn result_value(op: Operation, regs: &Registers) -> u64 {
    match op {
        Operation::PosixMemalign => regs.current().rdi,
        _ => regs.return_value(),
    }
}

/// The engine-facing half of the tracer.
struct Sink {
    shared: Arc<Shared>,
}

impl Observer for Sink {
    fn on_syscall_invoke(
        &self,
        _index: usize,
        spec: &SyscallSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
        self.shared.invoke(spec.operation, tid, regs, arena);
    }

    fn on_syscall_result(
        &self,
        _index: usize,
        spec: &SyscallSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
        self.shared.result(spec.operation, tid, regs, arena);
    }

    fn on_function_invoke(
        &self,
        _index: usize,
        spec: &FunctionSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
        self.shared.invoke(spec.operation, tid, regs, arena);
    }

    fn on_function_result(
        &self,
        _index: usize,
        spec: &FunctionSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
        self.shared.result(spec.operation, tid, regs, arena);
    }

    fn on_library_loaded(&self, _tid: Pid) {
        self.shared.recorder.notify_mappings_changed();
    }

    fn on_new_thread(&self, parent: Pid, child: Pid) {
        self.shared
            .relations
            .lock()
            .push((parent.as_raw(), child.as_raw()));
    }
}

/// The traced operation catalog: the heap-management syscalls, the libc
/// allocation entry points, and the mangled C++ allocation operators.
fn build_registry() -> CallbackRegistry {
    let mut registry = CallbackRegistry::new();
    registry
        .syscall(libc::SYS_brk, Operation::Brk, true)
        .syscall(libc::SYS_mmap, Operation::Mmap, true)
        .syscall(libc::SYS_munmap, Operation::Munmap, true)
        .syscall(libc::SYS_clone, Operation::Clone, true)
        .syscall(libc::SYS_clone3, Operation::Clone3, true)
        .syscall(libc::SYS_fork, Operation::Fork, true)
        .syscall(libc::SYS_vfork, Operation::Vfork, true)
        .syscall(libc::SYS_execve, Operation::Execve, true);
    registry
        .function("sbrk", Operation::Sbrk, true)
        .function("free", Operation::Free, false)
        .function("malloc", Operation::Malloc, true)
        .function("calloc", Operation::Calloc, true)
        .function("realloc", Operation::Realloc, true)
        .function("valloc", Operation::Valloc, true)
        .function("posix_memalign", Operation::PosixMemalign, true)
        .function("aligned_alloc", Operation::AlignedAlloc, true)
        .function("_Znwm", Operation::New, true)
        .function("_Znam", Operation::NewArray, true)
        .function("_ZdlPv", Operation::DeleteLegacy, false)
        .function("_ZdlPvm", Operation::Delete, false)
        .function("_ZdaPv", Operation::DeleteArray, false);
    registry
}

pub struct Tracer {
    config: Config,
}

impl Tracer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Parses `args`, runs the whole trace and writes the artifacts.
    pub fn run(args: Args) -> anyhow::Result<()> {
        let config = Config::from_args(args)?;
        Tracer::new(config).trace()
    }

    fn trace(self) -> anyhow::Result<()> {
        let config = &self.config;
        config
            .prepare_output_dir()
            .with_context(|| format!("cannot create {}", config.parent_dir().display()))?;

        let target = match config.pid {
            Some(pid) => pid,
            None => {
                println!("Executing command: {}", config.command.join(" "));
                self.run_target()?
            }
        };

        // readable while the target is alive; gone once it exits
        let target_full_path = loader::resolve_executable_path(target)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|err| {
                warn!("{}", err);
                String::new()
            });

        let sink: Box<dyn Write + Send> = if config.collect_trace && config.save_trace {
            create_compressed_sink(&config.trace_path())
                .with_context(|| format!("cannot create {}", config.trace_path().display()))?
        } else {
            Box::new(io::sink())
        };
        let recorder = TraceRecorder::start(
            target,
            sink,
            RecorderConfig {
                capture_stacks: config.capture_stacks,
                max_stack_depth: config.max_stack_depth,
                print_records: config.print_records,
                print_stack: config.print_stack,
                print_entries: config.print_entries,
            },
        );
        let shared = Arc::new(Shared::new(recorder, config.collect_trace));

        let engine = match config.pid {
            Some(pid) => Engine::attach(
                pid,
                build_registry(),
                Sink {
                    shared: shared.clone(),
                },
            )?,
            None => Engine::new(
                target,
                build_registry(),
                Sink {
                    shared: shared.clone(),
                },
            ),
        };
        engine.run()?;

        let mut stat = self.gather_stats(&shared, target, target_full_path);
        let report = shared.recorder.shutdown();
        stat.filename_max_length = report.filename_max_length;
        stat.function_max_length = report.function_max_length;
        stat.finalize();

        if config.print_stats {
            stat.print();
        }
        stat.save(&config.stats_path())
            .with_context(|| format!("cannot save {}", config.stats_path().display()))?;
        Ok(())
    }

    /// Forks the configured command under tracing.
    fn run_target(&self) -> anyhow::Result<Pid> {
        let mut command = Command::new(&self.config.command[0]);
        command.args(&self.config.command[1..]).inherit_env();
        command
            .launch()
            .with_context(|| format!("cannot launch `{}`", self.config.command[0]))
    }

    fn gather_stats(&self, shared: &Shared, target: Pid, target_full_path: String) -> StatInfo {
        let config = &self.config;
        let relations = shared.relations.lock().clone();
        let mut stat = StatInfo {
            extra: config.extra.clone(),
            argv: config.argv.clone(),
            commands: config.command.clone(),
            target: config
                .command
                .first()
                .cloned()
                .unwrap_or_else(|| config.executable_name.clone()),
            target_full_path,
            working_dir: std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default(),
            save_path: config.parent_dir().display().to_string(),
            max_stack_depth: shared.max_stack_depth.load(Ordering::Relaxed),
            main_tid: target.as_raw(),
            child_tids: relations.iter().map(|&(_, child)| child).collect(),
            tid_relations: relations,
            timestamp_start: config.start_timestamp.clone(),
            timestamp_end: crate::config::local_timestamp(),
            elapsed_ns: shared.recorder.elapsed_ns(),
            ..Default::default()
        };
        for index in 0..OPERATION_COUNT {
            stat.invoke_counts[index] = shared.invoke_counts[index].load(Ordering::Relaxed);
            stat.result_counts[index] = shared.result_counts[index].load(Ordering::Relaxed);
        }
        stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::is_invoke;

    #[test]
    fn catalog_covers_every_interface_entry() {
        let registry = build_registry();
        assert_eq!(registry.syscalls().len(), 8);
        assert_eq!(registry.functions().len(), 13);

        let names = registry
            .functions()
            .iter()
            .map(|spec| spec.name)
            .collect::<Vec<_>>();
        for name in [
            "sbrk",
            "free",
            "malloc",
            "calloc",
            "realloc",
            "valloc",
            "posix_memalign",
            "aligned_alloc",
            "_Znwm",
            "_Znam",
            "_ZdlPv",
            "_ZdlPvm",
            "_ZdaPv",
        ] {
            assert!(names.contains(&name), "missing {}", name);
        }

        // operators without a result callback never get return traps
        for spec in registry.functions() {
            let expects_result = spec.operation.meta().has_return;
            assert_eq!(spec.has_result, expects_result, "{}", spec.name);
        }
    }

    #[test]
    fn tags_pair_invoke_and_result() {
        let registry = build_registry();
        for spec in registry.syscalls() {
            let invoke = spec.operation.invoke_tag();
            let result = spec.operation.result_tag();
            assert!(is_invoke(invoke));
            assert_eq!(invoke | 1, result);
        }
    }
}
