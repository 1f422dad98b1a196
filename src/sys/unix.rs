use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::exit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::flag;

#[cfg(target_os = "linux")]
use sd_notify::NotifyState;

use super::{Fork, Pid, ProcessEnvironment, SavedDisposition, Signal};
use crate::signal::SignalAction;
use crate::types::{Group, User};

/// Descriptor bound used when `RLIMIT_NOFILE` is unlimited.
const MAXFD: RawFd = 2048;

/// The real process, reached through libc.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl SystemEnvironment {
    pub fn new() -> Self {
        SystemEnvironment
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains an interior NUL byte",
        )
    })
}

fn name_to_cstring(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "name contains an interior NUL byte",
        )
    })
}

unsafe fn set_handler(signal: Signal, handler: libc::sighandler_t) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = 0;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        cvt(libc::sigaction(signal, &action, ptr::null_mut()))?;
    }
    Ok(())
}

impl ProcessEnvironment for SystemEnvironment {
    fn pid(&self) -> Pid {
        unsafe { libc::getpid() }
    }

    fn parent_pid(&self) -> Pid {
        unsafe { libc::getppid() }
    }

    fn fork(&self) -> io::Result<Fork> {
        match cvt(unsafe { libc::fork() })? {
            0 => Ok(Fork::Child),
            child => Ok(Fork::Parent(child)),
        }
    }

    fn create_session(&self) -> io::Result<Pid> {
        cvt(unsafe { libc::setsid() })
    }

    fn is_session_leader(&self) -> bool {
        unsafe { libc::getsid(0) == libc::getpid() }
    }

    fn has_controlling_terminal(&self) -> bool {
        let tty = b"/dev/tty\0";
        let fd = unsafe {
            libc::open(
                tty.as_ptr().cast(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return false;
        }
        unsafe { libc::close(fd) };
        true
    }

    fn stdin_is_socket(&self) -> bool {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(libc::STDIN_FILENO, stat.as_mut_ptr()) } < 0 {
            return false;
        }
        let stat = unsafe { stat.assume_init() };
        (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
    }

    fn supervised(&self) -> bool {
        // systemd's Type=notify keeps the service in the foreground
        cfg!(target_os = "linux") && std::env::var_os("NOTIFY_SOCKET").is_some()
    }

    fn wait_child(&self, pid: Pid) -> io::Result<i32> {
        let mut status: libc::c_int = 0;
        loop {
            if unsafe { libc::waitpid(pid, &mut status, 0) } >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        if libc::WIFEXITED(status) {
            Ok(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Ok(128 + libc::WTERMSIG(status))
        } else {
            Ok(status)
        }
    }

    fn exit(&self, code: i32) -> ! {
        exit(code)
    }

    fn exit_immediately(&self, code: i32) -> ! {
        unsafe { libc::_exit(code) }
    }

    fn prevent_core_dump(&self) -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        cvt(unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) })?;
        Ok(())
    }

    fn change_root(&self, path: &Path) -> io::Result<()> {
        let root = path_to_cstring(path)?;
        unsafe {
            cvt(libc::chdir(root.as_ptr()))?;
            cvt(libc::chroot(root.as_ptr()))?;
        }
        Ok(())
    }

    fn change_directory(&self, path: &Path) -> io::Result<()> {
        std::env::set_current_dir(path)
    }

    fn set_umask(&self, mask: u32) -> u32 {
        unsafe { libc::umask(mask as libc::mode_t) as u32 }
    }

    fn resolve_user(&self, user: &User) -> io::Result<u32> {
        match user {
            User::Id(id) => Ok(*id),
            User::Name(name) => {
                let cname = name_to_cstring(name)?;
                let pwd = unsafe { libc::getpwnam(cname.as_ptr()) };
                if pwd.is_null() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("user '{name}' not found"),
                    ));
                }
                Ok(unsafe { (*pwd).pw_uid })
            }
        }
    }

    fn resolve_group(&self, group: &Group) -> io::Result<u32> {
        match group {
            Group::Id(id) => Ok(*id),
            Group::Name(name) => {
                let cname = name_to_cstring(name)?;
                let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
                if grp.is_null() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("group '{name}' not found"),
                    ));
                }
                Ok(unsafe { (*grp).gr_gid })
            }
        }
    }

    fn set_group(&self, gid: u32) -> io::Result<()> {
        let gid = gid as libc::gid_t;
        unsafe {
            // Supplementary groups survive setgid, drop them while still root.
            if libc::geteuid() == 0 {
                cvt(libc::setgroups(1, &gid))?;
            }
            cvt(libc::setgid(gid))?;
        }
        Ok(())
    }

    fn set_user(&self, uid: u32) -> io::Result<()> {
        cvt(unsafe { libc::setuid(uid as libc::uid_t) })?;
        Ok(())
    }

    fn change_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let cpath = path_to_cstring(path)?;
        let uid = uid.map_or(libc::uid_t::MAX, |u| u as libc::uid_t);
        let gid = gid.map_or(libc::gid_t::MAX, |g| g as libc::gid_t);
        cvt(unsafe { libc::chown(cpath.as_ptr(), uid, gid) })?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_process_name(&self, name: &str) -> io::Result<()> {
        let cname = name_to_cstring(name)?;
        cvt(unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong, 0, 0, 0) })?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_process_name(&self, _name: &str) -> io::Result<()> {
        Ok(())
    }

    fn flush_standard_streams(&self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }

    fn open_null_device(&self) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")?;
        Ok(OwnedFd::from(file))
    }

    fn duplicate_onto(&self, source: RawFd, target: RawFd) -> io::Result<()> {
        loop {
            if unsafe { libc::dup2(source, target) } >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn open_descriptors(&self) -> Option<Vec<RawFd>> {
        let dir = if cfg!(target_os = "linux") {
            "/proc/self/fd"
        } else {
            "/dev/fd"
        };
        // The listing's own descriptor shows up too; it is closed by the
        // time the caller acts, and closing it again yields EBADF.
        let fds = fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
            .collect();
        Some(fds)
    }

    fn descriptor_limit(&self) -> RawFd {
        let mut limit = MaybeUninit::<libc::rlimit>::uninit();
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, limit.as_mut_ptr()) } < 0 {
            return MAXFD;
        }
        let limit = unsafe { limit.assume_init() };
        if limit.rlim_max == libc::RLIM_INFINITY {
            MAXFD
        } else {
            RawFd::try_from(limit.rlim_max).unwrap_or(RawFd::MAX)
        }
    }

    fn close_descriptor(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe { libc::close(fd) })?;
        Ok(())
    }

    fn install_signal(
        &self,
        signal: Signal,
        action: &SignalAction,
        shutdown: &Arc<AtomicBool>,
    ) -> io::Result<SavedDisposition> {
        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        cvt(unsafe { libc::sigaction(signal, ptr::null(), &mut previous) })?;

        let mut hooks = Vec::new();
        match action {
            SignalAction::Ignore => unsafe { set_handler(signal, libc::SIG_IGN)? },
            SignalAction::Default => unsafe { set_handler(signal, libc::SIG_DFL)? },
            SignalAction::Terminate => {
                // Order matters: the conditional hook sees the flag before the
                // second hook raises it, so only a repeated signal is fatal.
                hooks.push(flag::register_conditional_default(
                    signal,
                    Arc::clone(shutdown),
                )?);
                hooks.push(flag::register(signal, Arc::clone(shutdown))?);
            }
            SignalAction::Flag(raised) => {
                hooks.push(flag::register(signal, Arc::clone(raised))?);
            }
            SignalAction::Custom(handler) => {
                let handler = Arc::clone(&handler.0);
                // SAFETY: CustomHandler::new is unsafe and carries the
                // async-signal-safety obligation.
                hooks.push(unsafe { signal_hook::low_level::register(signal, move || handler())? });
            }
        }

        Ok(SavedDisposition {
            signal,
            previous: Some(previous),
            hooks,
        })
    }

    fn restore_signal(&self, saved: SavedDisposition) -> io::Result<()> {
        for hook in saved.hooks {
            signal_hook::low_level::unregister(hook);
        }
        if let Some(previous) = saved.previous {
            cvt(unsafe { libc::sigaction(saved.signal, &previous, ptr::null_mut()) })?;
        }
        Ok(())
    }

    fn send_signal(&self, pid: Pid, signal: Signal) -> io::Result<()> {
        cvt(unsafe { libc::kill(pid, signal) })?;
        Ok(())
    }

    fn notify_ready(&self) {
        #[cfg(target_os = "linux")]
        if self.supervised() {
            let _ = sd_notify::notify(false, &[NotifyState::Ready]);
        }
    }

    fn notify_stopping(&self) {
        #[cfg(target_os = "linux")]
        if self.supervised() {
            let _ = sd_notify::notify(false, &[NotifyState::Stopping]);
        }
    }
}
