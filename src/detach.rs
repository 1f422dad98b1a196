//! Fork/setsid/fork detachment from the controlling terminal.
//!
//! Reference: "Advanced Programming in the UNIX Environment", section 13.3.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

use tracing::{debug, error};

use crate::error::{DaemonError, DaemonResult, EXIT_OS_ERROR};
use crate::sys::{Fork, Pid, ProcessEnvironment};

/// Which side of a detachment the current process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachResult {
    /// The original caller of a spawn-and-continue. `child` is the daemon's
    /// pid; `direct_child` is false when a second fork put the daemon out of
    /// reach of `waitpid`.
    Parent { child: Pid, direct_child: bool },
    /// The daemon lineage.
    Daemon,
}

/// Performs the detachment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detacher {
    second_fork: bool,
}

impl Default for Detacher {
    fn default() -> Self {
        Self::new()
    }
}

fn detachment(call: &'static str) -> impl Fn(io::Error) -> DaemonError {
    move |source| DaemonError::Detachment { call, source }
}

/// True when there is nothing left to detach from: the parent is init, stdin
/// is a socket handed over by a superserver, or the process already leads a
/// session without a controlling terminal.
pub fn is_detached<E: ProcessEnvironment>(env: &E) -> bool {
    env.parent_pid() == 1
        || env.stdin_is_socket()
        || (env.is_session_leader() && !env.has_controlling_terminal())
}

impl Detacher {
    pub fn new() -> Self {
        Detacher { second_fork: true }
    }

    /// With the second fork (the default) the daemon is not a session leader
    /// and can never acquire a controlling terminal again.
    pub fn second_fork(mut self, enabled: bool) -> Self {
        self.second_fork = enabled;
        self
    }

    /// Spawn-and-exit. Returns only in the daemon; the original process exits
    /// with the intermediate child's status (0 once the daemon is running).
    /// A no-op on a process that [`is_detached`].
    pub fn detach<E: ProcessEnvironment>(&self, env: &E) -> DaemonResult<DetachResult> {
        if is_detached(env) {
            debug!(pid = env.pid(), "process already detached");
            return Ok(DetachResult::Daemon);
        }

        if let Fork::Parent(child) = env.fork().map_err(detachment("fork"))? {
            let status = if self.second_fork {
                // The intermediate exits as soon as the daemon is forked.
                match env.wait_child(child) {
                    Ok(status) => status,
                    Err(err) => {
                        error!(child, error = %err, "could not reap intermediate process");
                        EXIT_OS_ERROR
                    }
                }
            } else {
                0
            };
            debug!(child, status, "original process exiting");
            env.exit(status);
        }

        env.create_session().map_err(detachment("setsid"))?;

        if self.second_fork {
            if let Fork::Parent(_) = env.fork().map_err(detachment("second fork"))? {
                env.exit_immediately(0);
            }
        }

        debug!(pid = env.pid(), "detached from controlling terminal");
        Ok(DetachResult::Daemon)
    }

    /// Spawn-and-continue. The caller gets [`DetachResult::Parent`] with the
    /// daemon's pid; the daemon gets [`DetachResult::Daemon`].
    ///
    /// Only a failure of the first fork is returned to the caller. Failures
    /// inside the child lineage terminate that lineage with
    /// [`EXIT_OS_ERROR`], so the child never runs the caller's code.
    pub fn spawn<E: ProcessEnvironment>(&self, env: &E) -> DaemonResult<DetachResult> {
        let (mut reader, writer) = UnixStream::pair().map_err(detachment("socketpair"))?;

        let child = match env.fork().map_err(detachment("fork"))? {
            Fork::Parent(child) => child,
            Fork::Child => {
                drop(reader);
                self.become_daemon(env, writer);
                return Ok(DetachResult::Daemon);
            }
        };
        drop(writer);

        if !self.second_fork {
            debug!(child, "spawned daemon");
            return Ok(DetachResult::Parent {
                child,
                direct_child: true,
            });
        }

        // The intermediate reports the daemon's pid, then exits.
        let mut report = String::new();
        let read = reader.read_to_string(&mut report);
        let status = env.wait_child(child);
        match report.trim().parse::<Pid>() {
            Ok(daemon) => {
                debug!(daemon, intermediate = child, "spawned daemon");
                Ok(DetachResult::Parent {
                    child: daemon,
                    direct_child: false,
                })
            }
            Err(_) => {
                let reason = match (read, status) {
                    (Err(err), _) => err,
                    (_, Ok(status)) => io::Error::other(format!(
                        "intermediate process exited with status {status} before reporting the daemon pid"
                    )),
                    (_, Err(err)) => err,
                };
                Err(DaemonError::Detachment {
                    call: "second fork",
                    source: reason,
                })
            }
        }
    }

    /// Child side of [`spawn`](Detacher::spawn): new session, optional second
    /// fork, pid report. Returns only in the daemon.
    fn become_daemon<E: ProcessEnvironment>(&self, env: &E, mut writer: UnixStream) {
        if let Err(err) = env.create_session() {
            error!(error = %err, "setsid failed in spawned child");
            env.exit_immediately(EXIT_OS_ERROR);
        }
        if self.second_fork {
            match env.fork() {
                Ok(Fork::Parent(daemon)) => {
                    let _ = writeln!(writer, "{daemon}");
                    env.exit_immediately(0);
                }
                Ok(Fork::Child) => {}
                Err(err) => {
                    error!(error = %err, "second fork failed in spawned child");
                    env.exit_immediately(EXIT_OS_ERROR);
                }
            }
        }
        drop(writer);
    }
}
