//! Spawn-and-continue: start a daemon running an entry function and keep
//! going in the caller.

use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

use signal_hook::consts::signal::SIGTERM;
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::detach::{DetachResult, Detacher};
use crate::error::{DaemonError, DaemonResult, EXIT_ENTRY_FAILED};
use crate::pidfile::PidLockFile;
use crate::sys::{Liveness, Pid, ProcessEnvironment, SystemEnvironment};

/// A daemon that has been configured but not started.
pub struct Daemon<F, E: ProcessEnvironment = SystemEnvironment> {
    entry: F,
    context: DaemonContext<E>,
    break_stale_lock: bool,
}

impl<F, E: ProcessEnvironment> fmt::Debug for Daemon<F, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("entry", &"FnOnce")
            .field("context", &self.context)
            .field("break_stale_lock", &self.break_stale_lock)
            .finish()
    }
}

/// Pairs an entry function with the context it runs in.
///
/// ```no_run
/// use daemon_context::{DaemonContext, create_daemon};
///
/// let context = DaemonContext::new().pid_file("/run/worker.pid");
/// let handle = create_daemon(
///     |ctx: &DaemonContext| -> Result<(), std::io::Error> {
///         while !ctx.shutdown_requested() {
///             std::thread::sleep(std::time::Duration::from_secs(1));
///         }
///         Ok(())
///     },
///     context,
/// )
/// .start()?;
/// println!("daemon running as {}", handle.pid());
/// # Ok::<(), daemon_context::DaemonError>(())
/// ```
pub fn create_daemon<F, X, E>(entry: F, context: DaemonContext<E>) -> Daemon<F, E>
where
    F: FnOnce(&DaemonContext<E>) -> Result<(), X>,
    X: fmt::Display,
    E: ProcessEnvironment + Clone,
{
    Daemon {
        entry,
        context,
        break_stale_lock: true,
    }
}

impl<F, X, E> Daemon<F, E>
where
    F: FnOnce(&DaemonContext<E>) -> Result<(), X>,
    X: fmt::Display,
    E: ProcessEnvironment + Clone,
{
    /// If `true` (the default), the daemon removes a pid file whose recorded
    /// process is confirmed dead before it takes the lock.
    pub fn break_stale_lock(mut self, enabled: bool) -> Self {
        self.break_stale_lock = enabled;
        self
    }

    /// Spawns the daemon and returns its handle in the caller.
    ///
    /// The daemon side never returns from this call: it opens the context,
    /// runs the entry function, closes the context and exits with `0`,
    /// [`EXIT_ENTRY_FAILED`] when the entry fails or panics, or
    /// [`DaemonError::exit_code`] when the context cannot be opened.
    pub fn start(self) -> DaemonResult<DaemonHandle<E>> {
        let env = self.context.environment().clone();
        let detacher = Detacher::new().second_fork(self.context.uses_second_fork());

        match detacher.spawn(&env)? {
            DetachResult::Parent {
                child,
                direct_child,
            } => {
                info!(pid = child, direct_child, "daemon started");
                Ok(DaemonHandle {
                    pid: child,
                    direct_child,
                    env,
                })
            }
            DetachResult::Daemon => {
                let code = self.run();
                debug!(code, "daemon exiting");
                env.exit(code)
            }
        }
    }

    /// Daemon side of [`start`](Self::start). Returns the exit status.
    fn run(self) -> i32 {
        let Daemon {
            entry,
            mut context,
            break_stale_lock,
        } = self;
        context.mark_detached();

        if break_stale_lock {
            if let Some(lock) = context.pid_lock_file() {
                if let Err(err) = lock.break_stale(context.environment()) {
                    // open() reports whatever is still in the way.
                    debug!(error = %err, "pid file not broken");
                }
            }
        }

        if let Err(err) = context.open() {
            error!(error = %err, "daemon failed to start");
            context.report_failure(&format!("daemon failed to start: {err}"));
            return err.exit_code();
        }

        let code = match catch_unwind(AssertUnwindSafe(|| entry(&context))) {
            Ok(Ok(())) => 0,
            Ok(Err(err)) => {
                error!(error = %err, "daemon entry failed");
                EXIT_ENTRY_FAILED
            }
            Err(_) => {
                error!("daemon entry panicked");
                EXIT_ENTRY_FAILED
            }
        };

        if let Err(err) = context.close() {
            warn!(error = %err, "daemon context did not close cleanly");
        }
        code
    }
}

/// The caller's view of a started daemon.
#[derive(Debug, Clone)]
pub struct DaemonHandle<E: ProcessEnvironment = SystemEnvironment> {
    pid: Pid,
    direct_child: bool,
    env: E,
}

impl<E: ProcessEnvironment> DaemonHandle<E> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// False when a second fork made the daemon a grandchild of the caller.
    pub fn is_direct_child(&self) -> bool {
        self.direct_child
    }

    /// Waits for a directly spawned daemon and returns its exit status.
    pub fn wait(&self) -> DaemonResult<i32> {
        if !self.direct_child {
            return Err(DaemonError::NotAChild { pid: self.pid });
        }
        Ok(self.env.wait_child(self.pid)?)
    }

    /// Sends SIGTERM to the daemon.
    pub fn terminate(&self) -> DaemonResult<()> {
        self.env
            .send_signal(self.pid, SIGTERM)
            .map_err(|source| DaemonError::Signal {
                signal: SIGTERM,
                source,
            })
    }

    pub fn is_running(&self) -> bool {
        self.env.probe_process(self.pid) == Liveness::Alive
    }
}

/// Stops the daemon recorded in `lock`.
///
/// A live holder gets SIGTERM and its pid is returned. A lock left by a dead
/// process is broken and `None` is returned. A missing pid file is an error.
pub fn stop<E: ProcessEnvironment>(env: &E, lock: &PidLockFile) -> DaemonResult<Option<Pid>> {
    let Some(pid) = lock.read_pid()? else {
        if !lock.is_locked() {
            return Err(DaemonError::pid_file(
                lock.path(),
                io::Error::new(io::ErrorKind::NotFound, "pid file is not locked"),
            ));
        }
        return Err(DaemonError::StaleLock {
            path: lock.path().to_path_buf(),
            pid: None,
        });
    };

    match env.probe_process(pid) {
        Liveness::Dead => {
            lock.break_stale(env)?;
            Ok(None)
        }
        Liveness::Alive | Liveness::Indeterminate => {
            env.send_signal(pid, SIGTERM)
                .map_err(|source| DaemonError::Signal {
                    signal: SIGTERM,
                    source,
                })?;
            info!(pid, path = %lock.path().display(), "sent SIGTERM to daemon");
            Ok(Some(pid))
        }
    }
}
