use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::sys::Pid;

/// Exit status of a spawned daemon whose entry function failed or panicked.
pub const EXIT_ENTRY_FAILED: i32 = 70;
/// Exit status for an OS-level failure while opening the daemon context.
pub const EXIT_OS_ERROR: i32 = 71;
/// Exit status when the pid lock file holds a stale lock.
pub const EXIT_STALE_LOCK: i32 = 73;
/// Exit status when another live instance holds the pid lock file.
pub const EXIT_ALREADY_LOCKED: i32 = 75;
/// Exit status when privileges could not be changed.
pub const EXIT_PRIVILEGE: i32 = 77;

/// Errors raised while turning the process into a daemon.
/// Each variant names the step that failed.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// fork or setsid failed. Nothing in the current lineage can recover from this.
    #[error("failed to detach process: {call} failed: {source}")]
    Detachment {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Another live (or possibly live) process holds the pid lock file.
    #[error("pid file {} is already locked by process {pid}", path.display())]
    AlreadyLocked { path: PathBuf, pid: Pid },

    /// The pid lock file exists but its holder is not known to be alive.
    /// It is never broken automatically.
    #[error("pid file {} holds a stale lock ({})", path.display(), describe_pid(*pid))]
    StaleLock { path: PathBuf, pid: Option<Pid> },

    /// Changing root, working directory, group or user failed.
    #[error("failed to {operation}: {source}")]
    Privilege {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// A standard stream could not be redirected.
    #[error("failed to redirect {stream}: {source}")]
    Redirection {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    /// Any other process environment change (rlimit, process name).
    #[error("failed to {operation}: {source}")]
    Environment {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// Installing or restoring a signal disposition failed.
    #[error("failed to set disposition of signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },

    /// Reading, writing or removing the pid file failed.
    #[error("pid file {} error: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The daemon was detached with a second fork, so it cannot be waited on.
    #[error("process {pid} is not a direct child of this process")]
    NotAChild { pid: Pid },

    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn describe_pid(pid: Option<Pid>) -> String {
    match pid {
        Some(pid) => format!("recorded pid {pid} is not running"),
        None => "no valid pid recorded".to_owned(),
    }
}

impl DaemonError {
    /// Exit status a spawned daemon uses when this error aborts its startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::AlreadyLocked { .. } => EXIT_ALREADY_LOCKED,
            DaemonError::StaleLock { .. } => EXIT_STALE_LOCK,
            DaemonError::Privilege { .. } => EXIT_PRIVILEGE,
            _ => EXIT_OS_ERROR,
        }
    }

    pub(crate) fn pid_file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DaemonError::PidFile {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn privilege(operation: impl Into<String>, source: io::Error) -> Self {
        DaemonError::Privilege {
            operation: operation.into(),
            source,
        }
    }
}

/// A specialized Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_errors_map_to_distinct_exit_codes() {
        let locked = DaemonError::AlreadyLocked {
            path: PathBuf::from("/run/x.pid"),
            pid: 42,
        };
        let stale = DaemonError::StaleLock {
            path: PathBuf::from("/run/x.pid"),
            pid: None,
        };
        assert_eq!(locked.exit_code(), EXIT_ALREADY_LOCKED);
        assert_eq!(stale.exit_code(), EXIT_STALE_LOCK);
        assert_ne!(locked.exit_code(), 0);
        assert_eq!(
            locked.to_string(),
            "pid file /run/x.pid is already locked by process 42"
        );
    }

    #[test]
    fn privilege_error_keeps_source() {
        let err = DaemonError::privilege(
            "set group id to 0",
            io::Error::from_raw_os_error(libc::EPERM),
        );
        assert_eq!(err.exit_code(), EXIT_PRIVILEGE);
        assert!(std::error::Error::source(&err).is_some());
    }
}
