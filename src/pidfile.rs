use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::{Liveness, Pid, ProcessEnvironment};

/// Pause between attempts of [`PidLockFile::acquire_within`].
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A pid file used as an exclusive, process-identifying lock.
///
/// While held, the file contains the decimal pid of the holder followed by a
/// newline. The file is created with `O_EXCL`, so two processes racing for a
/// free path cannot both win.
///
/// The held lock keeps its parent directory open, so it can still be checked
/// and removed after the process changes its root directory.
#[derive(Debug)]
pub struct PidLockFile {
    path: PathBuf,
    holder: Option<Pid>,
    directory: Option<OwnedFd>,
}

impl PidLockFile {
    /// Wraps `path`. Relative paths are resolved against the current
    /// directory now, since the daemon changes directory after locking.
    pub fn new<P: AsRef<Path>>(path: P) -> DaemonResult<Self> {
        let path = std::path::absolute(path.as_ref())
            .map_err(|e| DaemonError::pid_file(path.as_ref(), e))?;
        Ok(PidLockFile::at(path))
    }

    pub(crate) fn at(path: PathBuf) -> Self {
        PidLockFile {
            path,
            holder: None,
            directory: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pid this handle wrote, while it holds the lock.
    pub fn holder(&self) -> Option<Pid> {
        self.holder
    }

    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    /// Descriptor of the parent directory while the lock is held. It must
    /// survive the closing of inherited descriptors.
    pub(crate) fn directory_fd(&self) -> Option<RawFd> {
        self.directory.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Reads the pid recorded in the file. `Ok(None)` when the file is
    /// missing or does not hold a positive decimal pid.
    pub fn read_pid(&self) -> DaemonResult<Option<Pid>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_pid(&content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DaemonError::pid_file(&self.path, err)),
        }
    }

    /// True when the file exists, whoever holds it.
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Takes the lock for the calling process.
    ///
    /// Fails with [`DaemonError::AlreadyLocked`] when the recorded pid is
    /// alive or its liveness cannot be established, and with
    /// [`DaemonError::StaleLock`] when the holder is gone or the content is
    /// unreadable. A stale lock is never broken here; see [`break_stale`].
    ///
    /// [`break_stale`]: PidLockFile::break_stale
    pub fn acquire<E: ProcessEnvironment>(&mut self, env: &E) -> DaemonResult<()> {
        if let Some(pid) = self.holder {
            debug!(pid, path = %self.path.display(), "pid file already held by this handle");
            return Ok(());
        }

        let pid = env.pid();
        let mut file = loop {
            let created = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&self.path);
            match created {
                Ok(file) => break file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(err) = self.existing_lock_error(env)? {
                        return Err(err);
                    }
                    // The holder let go between the create and the read.
                }
                Err(err) => return Err(DaemonError::pid_file(&self.path, err)),
            }
        };

        let written = writeln!(file, "{pid}")
            .and_then(|()| file.sync_all())
            .and_then(|()| open_parent_directory(&self.path));
        let directory = match written {
            Ok(directory) => directory,
            Err(err) => {
                // Do not leave a half-written lock behind.
                let _ = fs::remove_file(&self.path);
                return Err(DaemonError::pid_file(&self.path, err));
            }
        };

        self.holder = Some(pid);
        self.directory = Some(directory);
        info!(pid, path = %self.path.display(), "acquired pid lock file");
        Ok(())
    }

    /// Like [`acquire`](Self::acquire), but keeps retrying while a live
    /// process holds the lock, until `timeout` has passed.
    pub fn acquire_within<E: ProcessEnvironment>(
        &mut self,
        env: &E,
        timeout: Duration,
    ) -> DaemonResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire(env) {
                Err(DaemonError::AlreadyLocked { pid, .. }) if Instant::now() < deadline => {
                    debug!(pid, path = %self.path.display(), "pid file locked; retrying");
                    let left = deadline.saturating_duration_since(Instant::now());
                    thread::sleep(RETRY_INTERVAL.min(left));
                }
                outcome => return outcome,
            }
        }
    }

    /// Classifies an existing lock. `None` when the file is already gone.
    fn existing_lock_error<E: ProcessEnvironment>(
        &self,
        env: &E,
    ) -> DaemonResult<Option<DaemonError>> {
        let path = self.path.clone();
        Ok(Some(match self.read_pid()? {
            Some(pid) => match env.probe_process(pid) {
                Liveness::Alive | Liveness::Indeterminate => DaemonError::AlreadyLocked { path, pid },
                Liveness::Dead => DaemonError::StaleLock {
                    path,
                    pid: Some(pid),
                },
            },
            None if !self.is_locked() => return Ok(None),
            None => DaemonError::StaleLock { path, pid: None },
        }))
    }

    /// Gives up the lock. The file is removed only if it still records the
    /// holder's pid; a file rewritten by someone else is left in place.
    /// Calling this on a handle that does not hold the lock does nothing.
    pub fn release(&mut self) -> DaemonResult<()> {
        let Some(pid) = self.holder.take() else {
            return Ok(());
        };
        let Some(directory) = self.directory.take() else {
            return Ok(());
        };
        let fail = |e| DaemonError::pid_file(&self.path, e);

        // Through the directory descriptor, since the path may no longer
        // resolve once the root directory has changed.
        let name = self.file_name().map_err(fail)?;
        match read_pid_at(&directory, &name).map_err(fail)? {
            Some(recorded) if recorded == pid => {
                unlink_at(&directory, &name).map_err(fail)?;
                info!(pid, path = %self.path.display(), "released pid lock file");
            }
            recorded => {
                warn!(
                    pid,
                    ?recorded,
                    path = %self.path.display(),
                    "pid file no longer records this process; leaving it in place"
                );
            }
        }
        Ok(())
    }

    /// Removes a lock whose recorded pid is dead.
    ///
    /// Refuses with [`DaemonError::AlreadyLocked`] when the pid is alive or
    /// indeterminate and with [`DaemonError::StaleLock`] when the content is
    /// not a pid. A missing file is not an error.
    ///
    /// The file is first renamed aside and checked again, so a lock taken by
    /// another process between the check and the removal is put back instead
    /// of deleted.
    pub fn break_stale<E: ProcessEnvironment>(&self, env: &E) -> DaemonResult<()> {
        let pid = match self.read_pid()? {
            Some(pid) => pid,
            None if !self.is_locked() => return Ok(()),
            None => {
                return Err(DaemonError::StaleLock {
                    path: self.path.clone(),
                    pid: None,
                });
            }
        };
        match env.probe_process(pid) {
            Liveness::Dead => {}
            Liveness::Alive | Liveness::Indeterminate => {
                return Err(DaemonError::AlreadyLocked {
                    path: self.path.clone(),
                    pid,
                });
            }
        }

        let aside = self.aside_path(env.pid());
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(DaemonError::pid_file(&self.path, err)),
        }

        let moved = fs::read_to_string(&aside)
            .ok()
            .and_then(|content| parse_pid(&content));
        if moved != Some(pid) {
            // Someone re-acquired in between; hand the file back unless yet
            // another lock already took the path.
            if let Err(err) = fs::hard_link(&aside, &self.path) {
                warn!(path = %self.path.display(), error = %err, "could not restore a re-acquired pid file");
            }
            remove_if_present(&aside)?;
            return Err(match moved {
                Some(holder) => DaemonError::AlreadyLocked {
                    path: self.path.clone(),
                    pid: holder,
                },
                None => DaemonError::StaleLock {
                    path: self.path.clone(),
                    pid: None,
                },
            });
        }

        remove_if_present(&aside)?;
        info!(pid, path = %self.path.display(), "broke stale pid lock file");
        Ok(())
    }

    fn file_name(&self) -> io::Result<CString> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pid file has no file name"))?;
        CString::new(name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn aside_path(&self, pid: Pid) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".stale.{pid}"));
        self.path.with_file_name(name)
    }
}

fn open_parent_directory(path: &Path) -> io::Result<OwnedFd> {
    let parent = path.parent().unwrap_or(Path::new("/"));
    let directory = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(parent)?;
    Ok(OwnedFd::from(directory))
}

fn read_pid_at(directory: &OwnedFd, name: &CString) -> io::Result<Option<Pid>> {
    let fd = unsafe {
        libc::openat(
            directory.as_raw_fd(),
            name.as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(err),
        };
    }
    // SAFETY: openat just returned this descriptor and nothing else owns it.
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(parse_pid(&String::from_utf8_lossy(&content)))
}

fn unlink_at(directory: &OwnedFd, name: &CString) -> io::Result<()> {
    if unsafe { libc::unlinkat(directory.as_raw_fd(), name.as_ptr(), 0) } < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            return Err(err);
        }
    }
    Ok(())
}

fn parse_pid(content: &str) -> Option<Pid> {
    content.trim().parse::<Pid>().ok().filter(|pid| *pid > 0)
}

fn remove_if_present(path: &Path) -> DaemonResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(DaemonError::pid_file(path, err)),
    }
}
