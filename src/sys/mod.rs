//! The process-wide state a daemon changes, behind one trait.
//!
//! Every step of daemonization mutates global process state: the process
//! table (fork, setsid), signal dispositions, the working directory, the
//! umask, credentials and the standard descriptors. All of it goes through
//! [`ProcessEnvironment`], so the orchestration can be driven against a
//! simulated process in tests while [`SystemEnvironment`] talks to the kernel.

use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::signal::SignalAction;
use crate::types::{Group, User};

pub(crate) mod unix;
#[cfg(test)]
pub(crate) mod simulated;

pub use unix::SystemEnvironment;

/// A process id.
pub type Pid = libc::pid_t;
/// A signal number, as found in `signal_hook::consts`.
pub type Signal = libc::c_int;

/// Outcome of a fork, seen from one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(Pid),
    Child,
}

/// Result of probing a pid with a zero signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The kernel reported `ESRCH`.
    Dead,
    /// Anything else, typically `EPERM`. Never treated as dead.
    Indeterminate,
}

/// The disposition a signal had before an action was installed.
pub struct SavedDisposition {
    pub(crate) signal: Signal,
    pub(crate) previous: Option<libc::sigaction>,
    pub(crate) hooks: Vec<signal_hook::SigId>,
}

impl SavedDisposition {
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl fmt::Debug for SavedDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedDisposition")
            .field("signal", &self.signal)
            .field("previous", &self.previous.is_some())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

pub trait ProcessEnvironment {
    // --- Identity & process table ---

    fn pid(&self) -> Pid;
    fn parent_pid(&self) -> Pid;
    fn fork(&self) -> io::Result<Fork>;
    /// Starts a new session with the caller as leader (`setsid`).
    fn create_session(&self) -> io::Result<Pid>;
    fn is_session_leader(&self) -> bool;
    fn has_controlling_terminal(&self) -> bool;
    /// True when stdin is a socket, i.e. the process was started by a superserver.
    fn stdin_is_socket(&self) -> bool;
    /// True when a service manager expects readiness notifications (`NOTIFY_SOCKET`).
    fn supervised(&self) -> bool;
    /// Blocks until the direct child `pid` exits; returns its exit status
    /// (128 + signal number when killed by a signal).
    fn wait_child(&self, pid: Pid) -> io::Result<i32>;
    /// Exits the process, flushing what the runtime flushes on a normal exit.
    fn exit(&self, code: i32) -> !;
    /// Exits without running any exit handlers (`_exit`). Used by intermediate forks.
    fn exit_immediately(&self, code: i32) -> !;

    // --- Privileges & filesystem context ---

    fn prevent_core_dump(&self) -> io::Result<()>;
    fn change_root(&self, path: &Path) -> io::Result<()>;
    fn change_directory(&self, path: &Path) -> io::Result<()>;
    /// Sets the umask and returns the previous one.
    fn set_umask(&self, mask: u32) -> u32;
    fn resolve_user(&self, user: &User) -> io::Result<u32>;
    fn resolve_group(&self, group: &Group) -> io::Result<u32>;
    fn set_group(&self, gid: u32) -> io::Result<()>;
    fn set_user(&self, uid: u32) -> io::Result<()>;
    fn change_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;
    fn set_process_name(&self, name: &str) -> io::Result<()>;

    // --- Descriptors ---

    fn flush_standard_streams(&self);
    fn open_null_device(&self) -> io::Result<OwnedFd>;
    /// `dup2(source, target)`.
    fn duplicate_onto(&self, source: RawFd, target: RawFd) -> io::Result<()>;
    /// Precise list of open descriptors, when the platform exposes one.
    fn open_descriptors(&self) -> Option<Vec<RawFd>>;
    /// Upper bound (exclusive) for descriptor numbers when no precise list exists.
    fn descriptor_limit(&self) -> RawFd;
    fn close_descriptor(&self, fd: RawFd) -> io::Result<()>;

    // --- Signals ---

    /// Installs `action` for `signal`. [`SignalAction::Terminate`] raises `shutdown`.
    fn install_signal(
        &self,
        signal: Signal,
        action: &SignalAction,
        shutdown: &Arc<AtomicBool>,
    ) -> io::Result<SavedDisposition>;
    fn restore_signal(&self, saved: SavedDisposition) -> io::Result<()>;
    fn send_signal(&self, pid: Pid, signal: Signal) -> io::Result<()>;

    /// Probes `pid` with the null signal.
    fn probe_process(&self, pid: Pid) -> Liveness {
        match self.send_signal(pid, 0) {
            Ok(()) => Liveness::Alive,
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Liveness::Dead,
            Err(_) => Liveness::Indeterminate,
        }
    }

    // --- Service manager ---

    fn notify_ready(&self);
    fn notify_stopping(&self);
}

#[cfg(test)]
mod tests {
    use super::simulated::SimulatedEnvironment;
    use super::*;

    #[test]
    fn probe_maps_errno_conservatively() {
        let env = SimulatedEnvironment::new(100);
        env.add_live_process(200);
        env.add_foreign_process(300);

        assert_eq!(env.probe_process(200), Liveness::Alive);
        assert_eq!(env.probe_process(999), Liveness::Dead);
        // EPERM means the process exists but belongs to someone else.
        assert_eq!(env.probe_process(300), Liveness::Indeterminate);
    }
}
