//! Remote stack capture through libunwind's ptrace accessors. Each
//! traced thread owns one arena; the underlying address space and UPT
//! handle are created on first capture and live until the thread state
//! is dropped.

use std::mem::MaybeUninit;
use std::os::raw::c_void;

use log::warn;
use nix::unistd::Pid;
use unwind_sys::{
    unw_create_addr_space, unw_cursor_t, unw_destroy_addr_space, unw_get_reg, unw_init_remote,
    unw_step, unw_word_t, _UPT_accessors, _UPT_create, _UPT_destroy, UNW_REG_IP,
};

pub const STACK_MAX: usize = 100;

struct Remote {
    addr_space: unwind_sys::unw_addr_space_t,
    upt: *mut c_void,
}

// The handles are only used from the owning supervisor thread; the
// registry moves them across threads inside a mutex.
unsafe impl Send for Remote {}

impl Remote {
    fn new(tid: Pid) -> Option<Self> {
        unsafe {
            let addr_space = unw_create_addr_space(std::ptr::addr_of!(_UPT_accessors) as *mut _, 0);
            if addr_space.is_null() {
                warn!("[{}] failed to create unwind address space", tid);
                return None;
            }
            let upt = _UPT_create(tid.as_raw());
            if upt.is_null() {
                warn!("[{}] failed to create unwind context", tid);
                unw_destroy_addr_space(addr_space);
                return None;
            }
            Some(Self { addr_space, upt })
        }
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        unsafe {
            _UPT_destroy(self.upt);
            unw_destroy_addr_space(self.addr_space);
        }
    }
}

/// Per-thread unwind resource. Capture failures degrade to an empty
/// stack; the record is still produced.
#[derive(Default)]
pub struct Arena {
    remote: Option<Remote>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the stopped thread's instruction-pointer chain into `buf`,
    /// innermost frame first. Returns the number of frames captured;
    /// zero when the unwinder cannot be initialised.
    pub fn capture(&mut self, tid: Pid, buf: &mut [u64; STACK_MAX], max_depth: usize) -> u16 {
        if self.remote.is_none() {
            self.remote = Remote::new(tid);
        }
        let Some(remote) = self.remote.as_ref() else {
            return 0;
        };

        let limit = max_depth.min(STACK_MAX);
        if limit == 0 {
            return 0;
        }

        unsafe {
            let mut cursor = MaybeUninit::<unw_cursor_t>::zeroed().assume_init();
            if unw_init_remote(&mut cursor, remote.addr_space, remote.upt) != 0 {
                warn!("[{}] failed to initialise unwind cursor", tid);
                return 0;
            }

            let mut depth = 0usize;
            loop {
                let mut ip: unw_word_t = 0;
                unw_get_reg(&mut cursor, UNW_REG_IP, &mut ip);
                buf[depth] = ip;
                depth += 1;
                if depth >= limit || unw_step(&mut cursor) <= 0 {
                    break;
                }
            }
            depth as u16
        }
    }
}
