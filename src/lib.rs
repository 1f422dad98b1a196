//! # daemon_context
//!
//! Turns the current process into a well-behaved Unix daemon: detaches from
//! the controlling terminal, installs a signal map, takes a pid lock file,
//! changes directory, umask and credentials, and redirects the standard
//! streams. Closing the context releases the lock and restores the signals.
//!
//! ```no_run
//! use daemon_context::DaemonContext;
//!
//! let mut context = DaemonContext::new()
//!     .pid_file("/run/worker.pid")
//!     .working_directory("/var/lib/worker");
//!
//! let daemon = context.enter()?;
//! while !daemon.shutdown_requested() {
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! daemon.close()?;
//! # Ok::<(), daemon_context::DaemonError>(())
//! ```
//!
//! To keep running in the caller, use [`create_daemon`] and
//! [`Daemon::start`] instead.

#[cfg(not(unix))]
compile_error!("daemon_context only supports Unix targets");

mod context;
pub mod detach;
mod error;
mod factory;
pub mod pidfile;
pub mod privilege;
pub mod signal;
pub mod stdio;
mod sys;
mod types;

// Re-export public types to keep the API flat
pub use context::{ContextState, DaemonContext, DaemonGuard};
pub use detach::{DetachResult, Detacher, is_detached};
pub use error::{
    DaemonError, DaemonResult, EXIT_ALREADY_LOCKED, EXIT_ENTRY_FAILED, EXIT_OS_ERROR,
    EXIT_PRIVILEGE, EXIT_STALE_LOCK,
};
pub use factory::{Daemon, DaemonHandle, create_daemon, stop};
pub use pidfile::PidLockFile;
pub use signal::{CustomHandler, SignalAction, SignalMap};
pub use stdio::Stdio;
pub use sys::{Fork, Liveness, Pid, ProcessEnvironment, SavedDisposition, Signal, SystemEnvironment};
pub use types::{Group, User};
