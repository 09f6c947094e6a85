use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use nix::sys::ptrace;
use nix::unistd::{execvpe, fork, ForkResult, Pid};

/// A target command to spawn under tracing. The child enables
/// `PTRACE_TRACEME` before exec, so the first stop the parent observes
/// is the post-exec trap.
#[derive(Debug, Clone)]
pub struct Command {
    path: OsString,
    args: Vec<OsString>,
    envs: Vec<OsString>,
}

impl Command {
    pub fn new<P: AsRef<OsStr>>(program: P) -> Self {
        let path = program.as_ref().to_owned();
        Self {
            args: vec![path.clone()],
            envs: Vec::new(),
            path,
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.path
    }

    pub fn arg<A: AsRef<OsStr>>(&mut self, arg: A) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<A, I>(&mut self, args: I) -> &mut Self
    where
        A: AsRef<OsStr>,
        I: IntoIterator<Item = A>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, val: V) -> &mut Self {
        let mut kv = key.as_ref().to_owned();
        kv.push("=");
        kv.push(val.as_ref());
        self.envs.push(kv);
        self
    }

    pub fn inherit_env(&mut self) -> &mut Self {
        for (k, v) in env::vars_os() {
            self.env(k, v);
        }
        self
    }

    /// Forks and execs the target. Returns the child pid in the parent;
    /// the child never returns.
    pub fn launch(&self) -> nix::Result<Pid> {
        if let ForkResult::Parent { child } = unsafe { fork() }? {
            return Ok(child);
        }

        ptrace::traceme().expect("ptrace TRACEME");

        let path = CString::new(self.path.as_bytes()).unwrap();
        let args = self
            .args
            .iter()
            .map(|arg| CString::new(arg.as_bytes()).unwrap())
            .collect::<Vec<_>>();
        let envs = self
            .envs
            .iter()
            .map(|env| CString::new(env.as_bytes()).unwrap())
            .collect::<Vec<_>>();

        execvpe(path.as_ref(), args.as_ref(), envs.as_ref()).ok();

        unsafe { libc::exit(libc::EXIT_FAILURE) }
    }
}
