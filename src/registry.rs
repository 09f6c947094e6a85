use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use fnv::FnvHashMap as HashMap;
use log::warn;
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::arch::Word;
use crate::unwind::Arena;

/// A pending return-site trap: fire the result callback for
/// `function` when the thread reaches `address`.
#[derive(Debug, Clone, Copy)]
pub struct ReturnSite {
    pub address: Word,
    pub function: usize,
}

/// State only ever touched from the thread's own supervisor.
pub struct ThreadLocal {
    /// Phase bit per registered syscall spec: set between the entry
    /// stop and the matching exit stop.
    pub syscall_phase: Vec<bool>,
    /// Engine-internal phase bit for the built-in mmap bookkeeping.
    pub mmap_phase: bool,
    /// LIFO of outstanding return-site traps.
    pub return_stack: Vec<ReturnSite>,
    /// Lazily initialised remote unwinder for stack capture.
    pub arena: Arena,
}

/// Per-traced-thread state. `paused` is flipped by peer supervisors
/// during the single-step window; everything else stays behind the
/// `local` mutex, which only the owning supervisor takes.
pub struct ThreadState {
    pub tid: Pid,
    pub paused: AtomicBool,
    pub local: Mutex<ThreadLocal>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadState {
    fn new(tid: Pid, syscall_count: usize) -> Self {
        Self {
            tid,
            paused: AtomicBool::new(false),
            local: Mutex::new(ThreadLocal {
                syscall_phase: vec![false; syscall_count],
                mmap_phase: false,
                return_stack: Vec::new(),
                arena: Arena::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn set_supervisor(&self, handle: JoinHandle<()>) {
        *self.supervisor.lock() = Some(handle);
    }
}

/// All threads currently under supervision, plus the counter the
/// shutdown path polls. Writer side is held only on create/destroy.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: RwLock<HashMap<Pid, Arc<ThreadState>>>,
    active: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tid: Pid, syscall_count: usize) -> Arc<ThreadState> {
        let mut threads = self.threads.write();
        if let Some(existing) = threads.get(&tid) {
            warn!("[{}] thread already traced", tid);
            return existing.clone();
        }
        let state = Arc::new(ThreadState::new(tid, syscall_count));
        threads.insert(tid, state.clone());
        state
    }

    pub fn get(&self, tid: Pid) -> Option<Arc<ThreadState>> {
        self.threads.read().get(&tid).cloned()
    }

    /// Snapshot of every registered thread, for the quiesce loop.
    pub fn snapshot(&self) -> Vec<Arc<ThreadState>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn incr_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Joins every child supervisor. The root thread's supervisor runs
    /// on the caller's own thread and holds no handle.
    pub fn join_all(&self) {
        let handles = {
            let threads = self.threads.read();
            threads
                .values()
                .filter_map(|state| state.supervisor.lock().take())
                .collect::<Vec<_>>()
        };
        for handle in handles {
            if let Err(err) = handle.join() {
                warn!("supervisor panicked: {:?}", err);
            }
        }
    }
}
