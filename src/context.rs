use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::detach::{self, Detacher};
use crate::error::{DaemonError, DaemonResult};
use crate::pidfile::PidLockFile;
use crate::privilege::{self, Privileges};
use crate::signal::{self, InstalledSignals, SignalAction, SignalMap};
use crate::stdio::{self, Redirection, Stdio};
use crate::sys::{Liveness, Pid, ProcessEnvironment, Signal, SystemEnvironment};
use crate::types::{Group, User};

/// Lifecycle of a [`DaemonContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Configuration and state of one daemonization.
///
/// Configure with the builder methods, then [`open`](Self::open) (or
/// [`enter`](Self::enter) for a scope guard) to turn the current process
/// into a daemon. Opening detaches the process, installs the signal map,
/// takes the pid lock file, changes directory, umask and credentials, and
/// redirects the standard streams, in that order. [`close`](Self::close)
/// releases the lock and restores the signal dispositions.
pub struct DaemonContext<E: ProcessEnvironment = SystemEnvironment> {
    env: E,
    directory: PathBuf,
    umask: u32,
    root: Option<PathBuf>,
    user: Option<User>,
    group: Option<Group>,
    prevent_core: bool,
    detach: Option<bool>,
    second_fork: bool,
    files_preserve: BTreeSet<RawFd>,
    descriptor_floor: RawFd,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    signal_map: SignalMap,
    pid_file: Option<PidLockFile>,
    pid_file_timeout: Option<Duration>,
    chown_pid: bool,
    process_name: Option<String>,

    shutdown: Arc<AtomicBool>,
    installed: Option<InstalledSignals>,
    state: ContextState,
}

impl<E: ProcessEnvironment> fmt::Debug for DaemonContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonContext")
            .field("directory", &self.directory)
            .field("umask", &format_args!("{:o}", self.umask))
            .field("root", &self.root)
            .field("user", &self.user)
            .field("group", &self.group)
            .field("prevent_core", &self.prevent_core)
            .field("detach", &self.detach)
            .field("second_fork", &self.second_fork)
            .field("files_preserve", &self.files_preserve)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("signal_map", &self.signal_map)
            .field("pid_file", &self.pid_file)
            .field("pid_file_timeout", &self.pid_file_timeout)
            .field("process_name", &self.process_name)
            .field("state", &self.state)
            .finish()
    }
}

impl Default for DaemonContext<SystemEnvironment> {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonContext<SystemEnvironment> {
    /// Creates a new default configuration for the real process.
    ///
    /// # Defaults
    /// - Working directory: `/`
    /// - Umask: `0`
    /// - Stdio: `/dev/null`
    /// - Detach: unless the process is already detached or supervised
    /// - Signals: [`SignalMap::default`]
    /// - Core dumps: disabled
    pub fn new() -> Self {
        Self::with_environment(SystemEnvironment::new())
    }
}

impl<E: ProcessEnvironment> DaemonContext<E> {
    /// Creates a default configuration that acts through `env`.
    pub fn with_environment(env: E) -> Self {
        DaemonContext {
            env,
            directory: privilege::default_working_directory(),
            umask: 0,
            root: None,
            user: None,
            group: None,
            prevent_core: true,
            detach: None,
            second_fork: true,
            files_preserve: BTreeSet::new(),
            descriptor_floor: 3,
            stdin: Stdio::devnull(),
            stdout: Stdio::devnull(),
            stderr: Stdio::devnull(),
            signal_map: SignalMap::default(),
            pid_file: None,
            pid_file_timeout: None,
            chown_pid: false,
            process_name: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            installed: None,
            state: ContextState::Closed,
        }
    }

    // --- Public Getters ---

    pub fn environment(&self) -> &E {
        &self.env
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ContextState::Open
    }

    /// Returns the configured working directory.
    pub fn working_directory_path(&self) -> &Path {
        &self.directory
    }

    /// Returns the configured pid lock file, if any.
    pub fn pid_lock_file(&self) -> Option<&PidLockFile> {
        self.pid_file.as_ref()
    }

    pub fn uses_second_fork(&self) -> bool {
        self.second_fork
    }

    /// True once a [`SignalAction::Terminate`] signal has been delivered.
    /// The main loop should return so the context can close.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The flag behind [`shutdown_requested`](Self::shutdown_requested).
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Pid recorded in the pid file.
    pub fn recorded_pid(&self) -> DaemonResult<Option<Pid>> {
        self.pid_file
            .as_ref()
            .ok_or_else(|| DaemonError::Config("no pid file associated with daemon".to_owned()))?
            .read_pid()
    }

    /// True when the pid file records a process that answers the null signal.
    pub fn is_running(&self) -> bool {
        matches!(self.recorded_pid(), Ok(Some(pid)) if self.env.probe_process(pid) == Liveness::Alive)
    }

    // --- Builder Methods ---

    /// Sets the working directory for the daemon.
    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = path.into();
        self
    }

    /// Sets the umask for the daemon process.
    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = mask;
        self
    }

    /// Sets a chroot directory for the daemon.
    pub fn chroot<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.root = Some(path.into());
        self
    }

    /// Sets the user to run the daemon as (privilege dropping).
    pub fn user<U: Into<User>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the group to run the daemon as.
    pub fn group<G: Into<Group>>(mut self, group: G) -> Self {
        self.group = Some(group.into());
        self
    }

    /// If `true` (the default), sets RLIMIT_CORE to zero.
    pub fn prevent_core(mut self, prevent: bool) -> Self {
        self.prevent_core = prevent;
        self
    }

    /// Forces detaching on or off instead of auto-detecting.
    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = Some(detach);
        self
    }

    pub fn second_fork(mut self, enabled: bool) -> Self {
        self.second_fork = enabled;
        self
    }

    /// Keeps `fd` open when inherited descriptors are closed.
    pub fn preserve_fd(mut self, fd: RawFd) -> Self {
        self.files_preserve.insert(fd);
        self
    }

    /// Descriptors below `floor` are never closed. Defaults to 3.
    pub fn descriptor_floor(mut self, floor: RawFd) -> Self {
        self.descriptor_floor = floor;
        self
    }

    /// Configures the standard input stream.
    pub fn stdin<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stdin = stdio.into();
        self
    }

    /// Configures the standard output stream.
    pub fn stdout<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stdout = stdio.into();
        self
    }

    /// Configures the standard error stream.
    pub fn stderr<S: Into<Stdio>>(mut self, stdio: S) -> Self {
        self.stderr = stdio.into();
        self
    }

    /// Replaces the whole signal map.
    pub fn signal_map(mut self, map: SignalMap) -> Self {
        self.signal_map = map;
        self
    }

    /// Sets the action for one signal.
    pub fn signal(mut self, signal: Signal, action: SignalAction) -> Self {
        self.signal_map.insert(signal, action);
        self
    }

    /// Sets the path of the pid lock file. Relative paths are resolved
    /// against the current directory now.
    pub fn pid_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path = path.into();
        let path = std::path::absolute(&path).unwrap_or(path);
        self.pid_file = Some(PidLockFile::at(path));
        self
    }

    /// Waits up to `timeout` for a live holder to release the pid file
    /// instead of failing at once.
    pub fn pid_file_timeout(mut self, timeout: Duration) -> Self {
        self.pid_file_timeout = Some(timeout);
        self
    }

    /// If true, changes ownership of the pid file to the target user/group.
    pub fn chown_pid_file(mut self, chown: bool) -> Self {
        self.chown_pid = chown;
        self
    }

    /// Sets the process name shown by `ps` (Linux only).
    pub fn process_name(mut self, name: &str) -> Self {
        self.process_name = Some(name.to_owned());
        self
    }

    /// Validates configuration without opening the context.
    pub fn build(self) -> DaemonResult<Self> {
        if !self.directory.is_absolute() {
            return Err(DaemonError::Config(format!(
                "working directory {} is not absolute",
                self.directory.display()
            )));
        }
        if let Some(lock) = &self.pid_file {
            if lock.path().file_name().is_none() {
                return Err(DaemonError::Config(format!(
                    "pid file {} has no file name",
                    lock.path().display()
                )));
            }
            if lock.path().parent().map(|p| !p.exists()).unwrap_or(false) {
                return Err(DaemonError::Config(format!(
                    "pid file directory {} does not exist",
                    lock.path().parent().unwrap_or(Path::new("/")).display()
                )));
            }
        }
        if self.descriptor_floor < 0 {
            return Err(DaemonError::Config("descriptor floor is negative".to_owned()));
        }
        Ok(self)
    }

    // --- Lifecycle ---

    fn should_detach(&self) -> bool {
        self.detach
            .unwrap_or_else(|| !detach::is_detached(&self.env) && !self.env.supervised())
    }

    /// Turns the current process into a daemon.
    ///
    /// In spawn-and-exit use the original process exits inside this call and
    /// only the daemon returns. Calling `open` on an open context does
    /// nothing. If any step after detachment fails, the pid lock taken in
    /// this call is released and the signal dispositions are restored before
    /// the error is returned.
    pub fn open(&mut self) -> DaemonResult<()> {
        if self.state != ContextState::Closed {
            debug!(state = ?self.state, "daemon context already open");
            return Ok(());
        }
        self.state = ContextState::Opening;

        if self.should_detach() {
            let detacher = Detacher::new().second_fork(self.second_fork);
            if let Err(err) = detacher.detach(&self.env) {
                self.state = ContextState::Closed;
                return Err(err);
            }
        }

        match self.enter_daemon_state() {
            Ok(()) => {
                self.state = ContextState::Open;
                self.env.notify_ready();
                info!(pid = self.env.pid(), "daemon context open");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "daemon context failed to open; rolling back");
                self.roll_back();
                self.state = ContextState::Closed;
                Err(err)
            }
        }
    }

    fn enter_daemon_state(&mut self) -> DaemonResult<()> {
        if let Some(name) = &self.process_name {
            self.env
                .set_process_name(name)
                .map_err(|source| DaemonError::Environment {
                    operation: "set process name",
                    source,
                })?;
        }

        self.installed = Some(signal::install(&self.env, &self.signal_map, &self.shutdown)?);

        if let Some(lock) = self.pid_file.as_mut() {
            match self.pid_file_timeout {
                Some(timeout) => lock.acquire_within(&self.env, timeout)?,
                None => lock.acquire(&self.env)?,
            }
            if self.chown_pid && (self.user.is_some() || self.group.is_some()) {
                let identity =
                    privilege::resolve(&self.env, self.user.as_ref(), self.group.as_ref())?;
                self.env
                    .change_owner(lock.path(), identity.uid, identity.gid)
                    .map_err(|e| {
                        DaemonError::privilege(
                            format!("change owner of {}", lock.path().display()),
                            e,
                        )
                    })?;
            }
        }

        privilege::apply(
            &self.env,
            &Privileges {
                prevent_core: self.prevent_core,
                chroot: self.root.as_deref(),
                working_directory: &self.directory,
                umask: self.umask,
                user: self.user.as_ref(),
                group: self.group.as_ref(),
            },
        )?;

        let mut preserve = self.files_preserve.clone();
        preserve.extend(self.pid_file.as_ref().and_then(PidLockFile::directory_fd));
        stdio::redirect(
            &self.env,
            &Redirection {
                stdin: &self.stdin,
                stdout: &self.stdout,
                stderr: &self.stderr,
                preserve: &preserve,
                floor: self.descriptor_floor,
            },
        )
    }

    fn roll_back(&mut self) {
        if let Some(lock) = self.pid_file.as_mut() {
            if let Err(err) = lock.release() {
                warn!(error = %err, "failed to release pid file during rollback");
            }
        }
        if let Some(installed) = self.installed.take() {
            if self.shutdown_requested() {
                // A terminate signal already arrived; keep the handlers so it is not lost.
                warn!(
                    signals = installed.len(),
                    "shutdown already requested; leaving signal handlers installed"
                );
            } else if let Err(err) = signal::restore(&self.env, installed) {
                warn!(error = %err, "failed to restore signals during rollback");
            }
        }
    }

    /// Opens the context and returns a guard that closes it when dropped,
    /// including when the scope unwinds.
    pub fn enter(&mut self) -> DaemonResult<DaemonGuard<'_, E>> {
        self.open()?;
        Ok(DaemonGuard { context: self })
    }

    /// Runs `f` inside an open context and closes it afterwards.
    pub fn run<T, F>(&mut self, f: F) -> DaemonResult<T>
    where
        F: FnOnce(&DaemonContext<E>) -> T,
    {
        let guard = self.enter()?;
        let output = f(&guard);
        guard.close()?;
        Ok(output)
    }

    /// Leaves the daemon state: releases the pid lock file and restores the
    /// signal dispositions. Does nothing unless the context is open.
    pub fn close(&mut self) -> DaemonResult<()> {
        if self.state != ContextState::Open {
            return Ok(());
        }
        self.state = ContextState::Closing;
        self.env.notify_stopping();

        let released = match self.pid_file.as_mut() {
            Some(lock) => lock.release(),
            None => Ok(()),
        };
        let restored = match self.installed.take() {
            Some(installed) => signal::restore(&self.env, installed),
            None => Ok(()),
        };

        self.state = ContextState::Closed;
        info!(pid = self.env.pid(), "daemon context closed");
        released.and(restored)
    }

    /// Last-resort report of a startup failure to the configured stderr (or
    /// stdout) file, for when nobody is left to read a returned error.
    pub(crate) fn report_failure(&mut self, msg: &str) {
        let target = match (&mut self.stderr, &mut self.stdout) {
            (Stdio::RedirectToFile(f), _) | (_, Stdio::RedirectToFile(f)) => f,
            _ => return,
        };
        let _ = writeln!(target, "[daemon_context] {msg}");
        let _ = target.sync_all();
    }

    /// Drops detachment for a process that was already detached by the caller.
    pub(crate) fn mark_detached(&mut self) {
        self.detach = Some(false);
    }
}

impl<E: ProcessEnvironment> Drop for DaemonContext<E> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close daemon context on drop");
        }
    }
}

/// Scope guard returned by [`DaemonContext::enter`]. Closes the context
/// exactly once when dropped.
pub struct DaemonGuard<'a, E: ProcessEnvironment> {
    context: &'a mut DaemonContext<E>,
}

impl<E: ProcessEnvironment> DaemonGuard<'_, E> {
    /// Closes now and reports the outcome; the drop that follows is a no-op.
    pub fn close(self) -> DaemonResult<()> {
        self.context.close()
    }
}

impl<E: ProcessEnvironment> Deref for DaemonGuard<'_, E> {
    type Target = DaemonContext<E>;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl<E: ProcessEnvironment> Drop for DaemonGuard<'_, E> {
    fn drop(&mut self) {
        if let Err(err) = self.context.close() {
            warn!(error = %err, "failed to close daemon context");
        }
    }
}

impl<E: ProcessEnvironment> fmt::Debug for DaemonGuard<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DaemonGuard").field(&self.context.state).finish()
    }
}
