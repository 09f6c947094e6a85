use nix::unistd::Pid;

use crate::arch::Registers;
use crate::catalog::{FunctionSpec, SyscallSpec};
use crate::unwind::Arena;

/// Event sink driven by the engine's supervisors. Implementations run
/// on the supervisor thread of the stopped tracee, so the tracee's
/// registers are stable for the duration of the call; callbacks must
/// not block beyond a non-blocking enqueue.
#[allow(unused_variables)]
pub trait Observer: Send + Sync + 'static {
    fn on_syscall_invoke(
        &self,
        index: usize,
        spec: &SyscallSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
    }

    fn on_syscall_result(
        &self,
        index: usize,
        spec: &SyscallSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
    }

    fn on_function_invoke(
        &self,
        index: usize,
        spec: &FunctionSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
    }

    fn on_function_result(
        &self,
        index: usize,
        spec: &FunctionSpec,
        tid: Pid,
        regs: &Registers,
        arena: &mut Arena,
    ) {
    }

    /// A new image was discovered in the target's address space, or an
    /// existing one was remapped.
    fn on_library_loaded(&self, tid: Pid) {}

    /// A clone/fork/vfork event produced `child`.
    fn on_new_thread(&self, parent: Pid, child: Pid) {}
}
