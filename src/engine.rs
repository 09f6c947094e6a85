//! The debugger core: one supervisor per traced thread, breakpoint
//! bookkeeping shared under a reader-writer lock, syscall-entry/-exit
//! interception, and library-load discovery.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::arch::{Registers, Word};
use crate::breakpoint::BreakpointTable;
use crate::catalog::CallbackRegistry;
use crate::loader;
use crate::observer::Observer;
use crate::registry::{ReturnSite, ThreadRegistry, ThreadState};
use crate::util::{peek, wait_all, AsPid};

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACESYSGOOD
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_EXITKILL);

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not attach to {0}: {1}")]
    Attach(Pid, #[source] nix::Error),
    #[error("wait on {0} failed: {1}")]
    Wait(Pid, #[source] nix::Error),
    #[error("cannot access registers of {0}: {1}")]
    Registers(Pid, #[source] nix::Error),
    #[error("memory access at {0:#x} failed: {1}")]
    Memory(Word, #[source] nix::Error),
    #[error("cannot spawn supervisor: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Loader(#[from] loader::Error),
}

/// Paths of shared objects observed in mmap but not yet scanned
/// (`loading`) and paths whose symbols are installed (`loaded`). The
/// union only ever grows.
#[derive(Default)]
struct LibraryLoadSet {
    loading: HashSet<String>,
    loaded: HashSet<String>,
}

pub struct Engine<O> {
    target: Pid,
    registry: CallbackRegistry,
    observer: O,
    breakpoints: RwLock<BreakpointTable>,
    threads: ThreadRegistry,
    libraries: Mutex<LibraryLoadSet>,
    has_loading: AtomicBool,
    doing_setup: AtomicBool,
}

impl<O: Observer> Engine<O> {
    pub fn new(target: Pid, registry: CallbackRegistry, observer: O) -> Arc<Self> {
        Arc::new(Self {
            target,
            registry,
            observer,
            breakpoints: RwLock::new(BreakpointTable::new()),
            threads: ThreadRegistry::new(),
            libraries: Mutex::new(LibraryLoadSet::default()),
            has_loading: AtomicBool::new(false),
            doing_setup: AtomicBool::new(false),
        })
    }

    /// Attaches to an already-running process.
    pub fn attach<P: AsPid>(
        pid: P,
        registry: CallbackRegistry,
        observer: O,
    ) -> Result<Arc<Self>, Error> {
        let pid = pid.as_pid();
        ptrace::attach(pid).map_err(|err| Error::Attach(pid, err))?;
        Ok(Self::new(pid, registry, observer))
    }

    pub fn target(&self) -> Pid {
        self.target
    }

    /// Runs the root supervisor on the calling thread until the target
    /// exits, then drains the remaining supervisors.
    pub fn run(self: &Arc<Self>) -> Result<(), Error> {
        info!("engine for pid {} start", self.target);

        wait_all(self.target).map_err(|err| Error::Wait(self.target, err))?;

        // Images mapped before we attached never produce an mmap event;
        // seed the scan so the first syscall stop installs their
        // breakpoints.
        self.has_loading.store(true, Ordering::SeqCst);

        self.adopt_existing_threads()?;

        self.threads
            .register(self.target, self.registry.syscalls().len());
        self.supervise(self.target);

        while self.threads.active() != 0 {
            thread::sleep(SHUTDOWN_POLL);
        }
        self.threads.join_all();

        info!("engine for pid {} end", self.target);
        Ok(())
    }

    /// Attaches every thread that already exists in
    /// `/proc/<pid>/task`, each with its own supervisor.
    fn adopt_existing_threads(self: &Arc<Self>) -> Result<(), Error> {
        let task_dir = format!("/proc/{}/task", self.target);
        let entries = match std::fs::read_dir(&task_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot enumerate {}: {}", task_dir, err);
                return Ok(());
            }
        };
        for entry in entries.flatten() {
            let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            let tid = Pid::from_raw(tid);
            if tid == self.target {
                continue;
            }
            self.start_supervisor(tid, true)?;
        }
        Ok(())
    }

    /// Registers `tid` and runs its supervisor on a dedicated thread.
    fn start_supervisor(self: &Arc<Self>, tid: Pid, needs_attach: bool) -> Result<(), Error> {
        let state = self.threads.register(tid, self.registry.syscalls().len());
        self.threads.incr_active();
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("supervisor-{}", tid))
            .spawn(move || {
                let attached = if needs_attach {
                    match ptrace::attach(tid) {
                        Ok(()) => {
                            let _ = wait_all(tid);
                            true
                        }
                        Err(err) => {
                            warn!("[{}] cannot attach: {}", tid, err);
                            false
                        }
                    }
                } else {
                    true
                };
                if attached {
                    engine.supervise(tid);
                }
                engine.threads.decr_active();
            })
            .map_err(Error::Spawn)?;
        state.set_supervisor(handle);
        Ok(())
    }

    /// The per-thread wait loop. All errors are local: the supervisor
    /// logs and terminates, the rest of the target keeps being traced.
    fn supervise(self: &Arc<Self>, tid: Pid) {
        debug!("[{}] start supervising", tid);

        if let Err(err) = ptrace::setoptions(tid, TRACE_OPTIONS) {
            warn!("[{}] cannot set trace options: {}", tid, err);
            return;
        }
        if let Err(err) = ptrace::syscall(tid, None) {
            warn!("[{}] cannot resume: {}", tid, err);
            return;
        }

        loop {
            let status = match wait_all(tid) {
                Ok(status) => status,
                Err(err) => {
                    warn!("[{}] wait failed: {}", tid, err);
                    break;
                }
            };

            match status {
                WaitStatus::PtraceEvent(_, _, event)
                    if event == libc::PTRACE_EVENT_CLONE
                        || event == libc::PTRACE_EVENT_FORK
                        || event == libc::PTRACE_EVENT_VFORK =>
                {
                    if let Err(err) = self.follow_new_thread(tid) {
                        warn!("[{}] cannot follow new thread: {}", tid, err);
                    }
                }
                WaitStatus::PtraceEvent(..) => {
                    // exec and friends: nothing to do, resume below
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break,
                WaitStatus::PtraceSyscall(_) => {
                    if self.has_loading.load(Ordering::SeqCst) {
                        if let Err(err) = self.install_pending(tid) {
                            warn!("[{}] library setup failed: {}", tid, err);
                        }
                    }
                    if let Err(err) = self.dispatch_syscall(tid) {
                        warn!("[{}] syscall dispatch failed: {}", tid, err);
                    }
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    if let Err(err) = self.handle_trap(tid) {
                        warn!("[{}] trap handling failed: {}", tid, err);
                    }
                }
                WaitStatus::Stopped(_, sig) => {
                    // foreign signal: relay it into the target untouched
                    if ptrace::syscall(tid, sig).is_err() {
                        break;
                    }
                    continue;
                }
                _ => {}
            }

            if ptrace::syscall(tid, None).is_err() {
                // the thread vanished, e.g. exited during a single-step
                break;
            }
        }

        debug!("[{}] stop supervising", tid);
    }

    /// A clone/fork/vfork event: pick up the new tid from the event
    /// message, clear the kernel's default attachment and hand the
    /// child to a fresh supervisor, which re-attaches it.
    fn follow_new_thread(self: &Arc<Self>, parent: Pid) -> Result<(), Error> {
        let message = ptrace::getevent(parent).map_err(|err| Error::Wait(parent, err))?;
        let child = Pid::from_raw(message as i32);
        if child.as_raw() <= 0 {
            return Ok(());
        }

        debug!("[{}] new thread {}", parent, child);
        self.observer.on_new_thread(parent, child);

        let _ = wait_all(child);
        let _ = ptrace::detach(child, Signal::SIGSTOP);

        self.start_supervisor(child, true)
    }

    /// Toggles the per-thread syscall phase and fires the registered
    /// callbacks, then the engine's own mmap bookkeeping.
    fn dispatch_syscall(&self, tid: Pid) -> Result<(), Error> {
        let Some(state) = self.threads.get(tid) else {
            warn!("[{}] syscall stop for unknown thread", tid);
            return Ok(());
        };
        let regs = Registers::fetch(tid).map_err(|err| Error::Registers(tid, err))?;
        let number = regs.syscall_number() as i64;

        let mut local = state.local.lock();
        for (index, spec) in self.registry.syscalls().iter().enumerate() {
            if spec.number != number {
                continue;
            }
            if local.syscall_phase[index] {
                if spec.has_result {
                    self.observer
                        .on_syscall_result(index, spec, tid, &regs, &mut local.arena);
                }
                local.syscall_phase[index] = false;
            } else {
                self.observer
                    .on_syscall_invoke(index, spec, tid, &regs, &mut local.arena);
                local.syscall_phase[index] = true;
            }
        }

        if number == libc::SYS_mmap {
            if local.mmap_phase {
                local.mmap_phase = false;
                drop(local);
                self.mmap_result(tid, &regs)?;
            } else {
                local.mmap_phase = true;
                drop(local);
                self.mmap_invoke(&regs);
            }
        }
        Ok(())
    }

    /// Built-in mmap-entry hook: a file-backed mapping of a shared
    /// object queues the path for symbol installation.
    fn mmap_invoke(&self, regs: &Registers) {
        let fd = regs.argument(4).unwrap_or(u64::MAX);
        let Some(path) = loader::resolve_fd_path(self.target, fd) else {
            return;
        };
        let path = path.to_string_lossy().into_owned();
        if !loader::is_shared_object(&path) {
            return;
        }
        let mut libraries = self.libraries.lock();
        if libraries.loaded.contains(&path) {
            return;
        }
        debug!("library mapping observed: {}", path);
        libraries.loading.insert(path);
        self.has_loading.store(true, Ordering::SeqCst);
    }

    /// Built-in mmap-exit hook: a mapping that lands on top of
    /// installed breakpoints means a loader rewrote text under us.
    fn mmap_result(&self, tid: Pid, regs: &Registers) -> Result<(), Error> {
        let base = regs.return_value();
        let length = regs.argument(1).unwrap_or(0);
        let mut table = self.breakpoints.write();
        let (min, max) = table.watermarks();
        if table.is_empty() || base >= max || base.wrapping_add(length) <= min {
            return Ok(());
        }
        table
            .range_repair(tid, base, base.wrapping_add(length))
            .map_err(|err| Error::Memory(base, err))?;
        drop(table);
        self.observer.on_library_loaded(tid);
        Ok(())
    }

    /// Scans the memory map for images that are not installed yet and
    /// arms breakpoints for every registered function they export.
    /// Runs under the current syscall stop; the test-and-set flag keeps
    /// concurrent supervisors from doubling the work.
    fn install_pending(self: &Arc<Self>, tid: Pid) -> Result<(), Error> {
        if self.doing_setup.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let ignore = self.libraries.lock().loaded.clone();
        let result = loader::iterate_memory_map(self.target, &ignore, |path, base| {
            self.install_image(tid, path, base);
            false
        });
        self.doing_setup.store(false, Ordering::SeqCst);
        result.map_err(Error::from)
    }

    fn install_image(&self, tid: Pid, path: &str, base: Word) {
        {
            let mut libraries = self.libraries.lock();
            libraries.loaded.insert(path.to_owned());
            libraries.loading.remove(path);
            self.has_loading
                .store(!libraries.loading.is_empty(), Ordering::SeqCst);
        }
        self.observer.on_library_loaded(tid);

        let file = Path::new(path);
        if !file.exists() || !loader::is_elf_file(file) {
            return;
        }
        debug!("loading image {} at {:#x}", path, base);

        let mut table = self.breakpoints.write();
        let result = loader::iterate_symbols(file, false, |name, offset| {
            if offset == 0 {
                return false;
            }
            for (index, spec) in self.registry.functions().iter().enumerate() {
                if spec.name != name {
                    continue;
                }
                let addr = base + offset;
                if table.contains(addr) {
                    continue;
                }
                debug!(
                    "[function] {} #{} in {} base {:#x} offset {:#x}",
                    name, index, path, base, offset
                );
                table.map_function(addr, index);
                if let Err(err) = table.install(tid, addr) {
                    warn!("[{}] cannot install breakpoint at {:#x}: {}", tid, addr, err);
                }
            }
            false
        });
        if let Err(err) = result {
            // corrupt image: skip it, keep tracing without its symbols
            warn!("skipping image {}: {}", path, err);
        }
    }

    /// A SIGTRAP that is not a sysgood stop: either one of our
    /// breakpoints or a trap we do not own. Lookup order is
    /// function-entry, then this thread's return-stack top, then any
    /// other installed breakpoint.
    fn handle_trap(&self, tid: Pid) -> Result<(), Error> {
        let Some(state) = self.threads.get(tid) else {
            warn!("[{}] trap for unknown thread", tid);
            return Ok(());
        };
        let mut regs = Registers::fetch(tid).map_err(|err| Error::Registers(tid, err))?;
        let rip = regs.instruction_pointer();

        let entry = self.breakpoints.read().function_at(rip);
        if let Some((addr, index)) = entry {
            let spec = self.registry.functions()[index];
            {
                let mut local = state.local.lock();
                self.observer
                    .on_function_invoke(index, &spec, tid, &regs, &mut local.arena);
                if spec.has_result {
                    // [rsp] at entry is the return address; trap there
                    // to observe the result
                    let ret_addr = peek(tid, regs.stack_pointer())
                        .map_err(|err| Error::Memory(regs.stack_pointer(), err))?;
                    local.return_stack.push(ReturnSite {
                        address: ret_addr,
                        function: index,
                    });
                    let mut table = self.breakpoints.write();
                    if !table.contains(ret_addr) {
                        table
                            .install(tid, ret_addr)
                            .map_err(|err| Error::Memory(ret_addr, err))?;
                    }
                }
            }
            return self.step_past(tid, addr, &mut regs);
        }

        let site = state.local.lock().return_stack.last().copied();
        if let Some(site) = site {
            if site.address == rip.wrapping_sub(1) {
                let spec = self.registry.functions()[site.function];
                {
                    let mut local = state.local.lock();
                    local.return_stack.pop();
                    self.observer
                        .on_function_result(site.function, &spec, tid, &regs, &mut local.arena);
                }
                return self.step_past(tid, site.address, &mut regs);
            }
        }

        // a return site some other thread pushed, or a foreign trap:
        // step over it quietly
        if let Some(addr) = self.breakpoints.read().covers(rip) {
            return self.step_past(tid, addr, &mut regs);
        }
        Ok(())
    }

    /// Single-steps past the breakpoint at `addr`. The table's writer
    /// lock is held across the disable/step/enable window and every
    /// peer thread is quiesced, so no thread can run over the address
    /// while the trap byte is restored.
    fn step_past(&self, tid: Pid, addr: Word, regs: &mut Registers) -> Result<(), Error> {
        let mut table = self.breakpoints.write();
        let paused = self.pause_peers(tid);

        regs.set_instruction_pointer(addr);
        if let Err(err) = regs.write_modified(tid) {
            self.release_peers(&paused);
            return Err(Error::Registers(tid, err));
        }

        if let Err(err) = table.disable(tid, addr) {
            self.release_peers(&paused);
            return Err(Error::Memory(addr, err));
        }

        let mut steps = 0;
        loop {
            steps += 1;
            if let Err(err) = ptrace::step(tid, None) {
                warn!("[{}] single-step failed: {}", tid, err);
                break;
            }
            match wait_all(tid) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    // the thread will never run again; there is nothing
                    // to re-arm, but the peers must still be released
                    self.release_peers(&paused);
                    return Ok(());
                }
                Ok(WaitStatus::Stopped(_, sig)) if sig != Signal::SIGTRAP && steps < 2 => {
                    // a signal-delivery stop does not retire the
                    // instruction; step once more
                    continue;
                }
                Ok(_) => break,
                Err(err) => {
                    warn!("[{}] wait during single-step failed: {}", tid, err);
                    break;
                }
            }
        }

        let rearmed = table.enable(tid, addr);
        self.release_peers(&paused);
        rearmed.map_err(|err| Error::Memory(addr, err))
    }

    /// Sends SIGSTOP to every other attached thread and waits for each
    /// to report stopped. Threads that are not currently in a
    /// ptrace-controlled stop are skipped.
    fn pause_peers(&self, tid: Pid) -> Vec<Arc<ThreadState>> {
        let mut paused = Vec::new();
        for state in self.threads.snapshot() {
            state.paused.store(false, Ordering::SeqCst);
            if state.tid == tid {
                continue;
            }
            if ptrace::getsiginfo(state.tid).is_err() {
                continue;
            }
            if let Err(err) = signal::kill(state.tid, Signal::SIGSTOP) {
                warn!("[{}] cannot pause {}: {}", tid, state.tid, err);
                continue;
            }
            match wait_all(state.tid) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {}
                Ok(_) => {
                    state.paused.store(true, Ordering::SeqCst);
                    paused.push(state);
                }
                Err(err) => {
                    warn!("[{}] wait for paused {} failed: {}", tid, state.tid, err);
                }
            }
        }
        paused
    }

    fn release_peers(&self, paused: &[Arc<ThreadState>]) {
        for state in paused {
            if state.paused.swap(false, Ordering::SeqCst) {
                let _ = ptrace::syscall(state.tid, None);
            }
        }
    }
}
