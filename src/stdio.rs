use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tracing::{debug, trace};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::ProcessEnvironment;

/// Defines the behavior of input/output streams (stdin, stdout, stderr).
#[derive(Debug)]
pub enum Stdio {
    /// Redirects the stream to `/dev/null`. Default option.
    Devnull,
    /// Redirects the stream to the specified file.
    RedirectToFile(File),
    /// Keeps the original stream (useful for debugging, but not recommended for production).
    Keep,
}

impl Stdio {
    /// Creates a configuration that discards all output.
    pub fn devnull() -> Self {
        Stdio::Devnull
    }

    /// The descriptor that will back the stream, if the target is a file.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Stdio::RedirectToFile(f) => Some(f.as_raw_fd()),
            _ => None,
        }
    }
}

impl Default for Stdio {
    fn default() -> Self {
        Stdio::Devnull
    }
}

impl From<File> for Stdio {
    fn from(f: File) -> Self {
        Stdio::RedirectToFile(f)
    }
}

impl From<OwnedFd> for Stdio {
    fn from(fd: OwnedFd) -> Self {
        Stdio::RedirectToFile(File::from(fd))
    }
}

/// Where the three standard streams go and which other descriptors survive.
#[derive(Debug)]
pub struct Redirection<'a> {
    pub stdin: &'a Stdio,
    pub stdout: &'a Stdio,
    pub stderr: &'a Stdio,
    /// Descriptors never closed.
    pub preserve: &'a BTreeSet<RawFd>,
    /// Descriptors below this number are never closed.
    pub floor: RawFd,
}

impl Redirection<'_> {
    /// Descriptors to keep: the preserve set plus the files backing the streams.
    fn kept(&self) -> BTreeSet<RawFd> {
        let mut kept = self.preserve.clone();
        kept.extend(
            [self.stdin, self.stdout, self.stderr]
                .into_iter()
                .filter_map(Stdio::raw_fd),
        );
        kept
    }
}

/// Points the standard streams at their targets, then closes every other
/// inherited descriptor at or above the floor.
///
/// A failed redirection of a standard stream is fatal. Closing is best effort.
pub fn redirect<E: ProcessEnvironment>(env: &E, redirection: &Redirection<'_>) -> DaemonResult<()> {
    env.flush_standard_streams();

    redirect_stream(env, redirection.stdin, libc::STDIN_FILENO, "stdin")?;
    redirect_stream(env, redirection.stdout, libc::STDOUT_FILENO, "stdout")?;
    redirect_stream(env, redirection.stderr, libc::STDERR_FILENO, "stderr")?;

    let closed = close_inherited(env, &redirection.kept(), redirection.floor);
    debug!(closed, "closed inherited descriptors");
    Ok(())
}

fn redirect_stream<E: ProcessEnvironment>(
    env: &E,
    stdio: &Stdio,
    target_fd: RawFd,
    stream: &'static str,
) -> DaemonResult<()> {
    let fail = |source: io::Error| DaemonError::Redirection { stream, source };
    match stdio {
        Stdio::RedirectToFile(f) => {
            env.duplicate_onto(f.as_raw_fd(), target_fd).map_err(fail)?;
        }
        Stdio::Devnull => {
            let null = env.open_null_device().map_err(fail)?;
            // Only happens when the stream slot itself was closed before we started.
            if null.as_raw_fd() != target_fd {
                env.duplicate_onto(null.as_raw_fd(), target_fd).map_err(fail)?;
            } else {
                std::mem::forget(null);
            }
        }
        Stdio::Keep => {}
    }
    trace!(stream, "redirected standard stream");
    Ok(())
}

/// Closes every open descriptor `>= floor` not in `kept`. Returns how many
/// were closed.
pub fn close_inherited<E: ProcessEnvironment>(env: &E, kept: &BTreeSet<RawFd>, floor: RawFd) -> usize {
    let mut closed = 0;
    for fd in candidates(env) {
        if fd < floor || kept.contains(&fd) {
            continue;
        }
        match env.close_descriptor(fd) {
            Ok(()) => closed += 1,
            Err(err) if err.raw_os_error() == Some(libc::EBADF) => {}
            Err(err) => debug!(fd, error = %err, "ignoring failure to close descriptor"),
        }
    }
    closed
}

/// Open descriptors when the platform can list them, otherwise every
/// number below the descriptor limit, highest first. The fallback range is
/// walked lazily since the hard limit can be in the billions.
fn candidates<E: ProcessEnvironment>(env: &E) -> Box<dyn Iterator<Item = RawFd>> {
    match env.open_descriptors() {
        Some(fds) => Box::new(fds.into_iter()),
        None => Box::new((0..env.descriptor_limit()).rev()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::simulated::{Event, SimulatedEnvironment};
    use std::io::Write;

    fn redirection<'a>(
        stdin: &'a Stdio,
        stdout: &'a Stdio,
        stderr: &'a Stdio,
        preserve: &'a BTreeSet<RawFd>,
    ) -> Redirection<'a> {
        Redirection {
            stdin,
            stdout,
            stderr,
            preserve,
            floor: 3,
        }
    }

    #[test]
    fn devnull_targets_cover_all_three_streams() {
        let env = SimulatedEnvironment::new(10);
        let (null, preserve) = (Stdio::devnull(), BTreeSet::new());

        redirect(&env, &redirection(&null, &null, &null, &preserve)).unwrap();

        let dup_targets: Vec<RawFd> = env
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Duplicate { target, .. } => Some(target),
                _ => None,
            })
            .collect();
        assert_eq!(dup_targets, vec![0, 1, 2]);
        assert_eq!(env.events().first(), Some(&Event::Flush));
    }

    #[test]
    fn closes_everything_but_preserved_and_standard() {
        let env = SimulatedEnvironment::new(10);
        let null = Stdio::devnull();
        let preserve = BTreeSet::from([7]);

        redirect(&env, &redirection(&null, &null, &null, &preserve)).unwrap();

        assert_eq!(env.open_fds(), BTreeSet::from([0, 1, 2, 7]));
    }

    #[test]
    fn falls_back_to_descriptor_limit() {
        let env = SimulatedEnvironment::new(10);
        env.without_descriptor_listing();

        let closed = close_inherited(&env, &BTreeSet::from([9]), 3);

        assert_eq!(closed, 2);
        assert_eq!(env.open_fds(), BTreeSet::from([0, 1, 2, 9]));
    }

    #[test]
    fn huge_descriptor_limit_is_walked_lazily() {
        let env = SimulatedEnvironment::new(10);
        env.without_descriptor_listing();
        env.set_descriptor_limit(RawFd::MAX);

        let mut fds = candidates(&env);

        assert_eq!(fds.next(), Some(RawFd::MAX - 1));
        assert_eq!(fds.next(), Some(RawFd::MAX - 2));
    }

    #[test]
    fn file_target_is_kept_open() {
        let env = SimulatedEnvironment::new(10);
        let mut log = tempfile::tempfile().unwrap();
        writeln!(log, "before").unwrap();
        let log_fd = log.as_raw_fd();
        let (keep, out, preserve) = (Stdio::Keep, Stdio::from(log), BTreeSet::new());

        redirect(&env, &redirection(&keep, &out, &keep, &preserve)).unwrap();

        assert!(env.events().contains(&Event::Duplicate {
            source: log_fd,
            target: 1
        }));
        assert!(!env.events().contains(&Event::Close(log_fd)));
        // Keep leaves stdin alone.
        assert!(
            !env.events()
                .iter()
                .any(|e| matches!(e, Event::Duplicate { target: 0, .. }))
        );
    }

    #[test]
    fn failed_standard_stream_is_fatal() {
        let env = SimulatedEnvironment::new(10);
        env.fail_duplicate(2);
        let (null, preserve) = (Stdio::devnull(), BTreeSet::new());

        let err = redirect(&env, &redirection(&null, &null, &null, &preserve)).unwrap_err();

        assert!(matches!(err, DaemonError::Redirection { stream: "stderr", .. }));
        // Nothing is closed once redirection has failed.
        assert!(!env.events().iter().any(|e| matches!(e, Event::Close(_))));
    }
}
