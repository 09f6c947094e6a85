use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub trait AsPid {
    fn as_pid(self) -> Pid;
}

impl AsPid for Pid {
    fn as_pid(self) -> Pid {
        self
    }
}

impl AsPid for &Pid {
    fn as_pid(self) -> Pid {
        *self
    }
}

impl AsPid for i32 {
    fn as_pid(self) -> Pid {
        Pid::from_raw(self)
    }
}

/// Reads one word of target text/data at `addr`.
pub(crate) fn peek(pid: Pid, addr: u64) -> nix::Result<u64> {
    ptrace::read(pid, addr as ptrace::AddressType).map(|word| word as u64)
}

/// Writes one word of target text/data at `addr`.
pub(crate) fn poke(pid: Pid, addr: u64, word: u64) -> nix::Result<()> {
    ptrace::write(pid, addr as ptrace::AddressType, word as libc::c_long)
}

/// waitpid with __WALL, so non-child clone tasks are reported as well.
pub(crate) fn wait_all(pid: Pid) -> nix::Result<WaitStatus> {
    waitpid(pid, Some(WaitPidFlag::__WALL))
}
