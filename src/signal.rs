use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::signal::{SIGHUP, SIGTERM, SIGTSTP, SIGTTIN, SIGTTOU};
use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::{ProcessEnvironment, SavedDisposition, Signal};

/// What the daemon does when a signal arrives.
#[derive(Clone)]
pub enum SignalAction {
    /// `SIG_IGN`.
    Ignore,
    /// `SIG_DFL`.
    Default,
    /// Raise the context's shutdown flag so the main loop can return and the
    /// context can close. A second delivery while the flag is raised kills
    /// the process with the signal's default action.
    Terminate,
    /// Raise the given flag.
    Flag(Arc<AtomicBool>),
    /// Run a caller-supplied handler inside the signal handler.
    Custom(CustomHandler),
}

impl fmt::Debug for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Ignore => f.write_str("Ignore"),
            SignalAction::Default => f.write_str("Default"),
            SignalAction::Terminate => f.write_str("Terminate"),
            SignalAction::Flag(flag) => f
                .debug_tuple("Flag")
                .field(&flag.load(Ordering::Relaxed))
                .finish(),
            SignalAction::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A closure run from inside a signal handler.
#[derive(Clone)]
pub struct CustomHandler(pub(crate) Arc<dyn Fn() + Send + Sync>);

impl CustomHandler {
    /// # Safety
    ///
    /// `handler` runs in signal-handler context. It must only perform
    /// async-signal-safe operations: no allocation, no locks, no I/O through
    /// buffered writers.
    pub unsafe fn new<F>(handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        CustomHandler(Arc::new(handler))
    }
}

/// Mapping from signal number to the action installed when the daemon opens.
///
/// Entries keep insertion order; [`install`] walks them in that order and
/// [`restore`] undoes them in reverse.
#[derive(Debug, Clone)]
pub struct SignalMap {
    entries: Vec<(Signal, SignalAction)>,
}

impl Default for SignalMap {
    /// Job-control signals and hangup are ignored (there is no terminal to
    /// send them) and SIGTERM requests a graceful shutdown.
    fn default() -> Self {
        SignalMap::empty()
            .with(SIGTSTP, SignalAction::Ignore)
            .with(SIGTTIN, SignalAction::Ignore)
            .with(SIGTTOU, SignalAction::Ignore)
            .with(SIGHUP, SignalAction::Ignore)
            .with(SIGTERM, SignalAction::Terminate)
    }
}

impl SignalMap {
    /// A map with no entries. [`install`] still adds the SIGTERM and SIGHUP
    /// defaults; map them to [`SignalAction::Default`] to keep them untouched.
    pub fn empty() -> Self {
        SignalMap {
            entries: Vec::new(),
        }
    }

    /// Sets the action for `signal`, replacing any earlier entry.
    pub fn with(mut self, signal: Signal, action: SignalAction) -> Self {
        self.insert(signal, action);
        self
    }

    pub fn insert(&mut self, signal: Signal, action: SignalAction) {
        match self.entries.iter_mut().find(|(s, _)| *s == signal) {
            Some(entry) => entry.1 = action,
            None => self.entries.push((signal, action)),
        }
    }

    pub fn get(&self, signal: Signal) -> Option<&SignalAction> {
        self.entries
            .iter()
            .find(|(s, _)| *s == signal)
            .map(|(_, action)| action)
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.get(signal).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (Signal, &SignalAction)> {
        self.entries.iter().map(|(s, a)| (*s, a))
    }

    /// The map with the SIGTERM and SIGHUP defaults filled in where absent.
    fn with_required_defaults(&self) -> SignalMap {
        let mut map = self.clone();
        if !map.contains(SIGTERM) {
            map.insert(SIGTERM, SignalAction::Terminate);
        }
        if !map.contains(SIGHUP) {
            map.insert(SIGHUP, SignalAction::Ignore);
        }
        map
    }
}

/// Dispositions replaced by [`install`], in installation order.
#[derive(Debug, Default)]
pub struct InstalledSignals {
    saved: Vec<SavedDisposition>,
}

impl InstalledSignals {
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

/// Installs every action of `map`. On failure the dispositions already
/// replaced are put back before the error is returned.
pub fn install<E: ProcessEnvironment>(
    env: &E,
    map: &SignalMap,
    shutdown: &Arc<AtomicBool>,
) -> DaemonResult<InstalledSignals> {
    let mut installed = InstalledSignals::default();
    for (signal, action) in map.with_required_defaults().iter() {
        match env.install_signal(signal, action, shutdown) {
            Ok(saved) => {
                debug!(signal, ?action, "installed signal action");
                installed.saved.push(saved);
            }
            Err(source) => {
                if let Err(err) = restore(env, installed) {
                    warn!(error = %err, "failed to roll back signal dispositions");
                }
                return Err(DaemonError::Signal { signal, source });
            }
        }
    }
    Ok(installed)
}

/// Puts back the dispositions saved by [`install`], last installed first.
/// Every signal is attempted; the first failure is returned.
pub fn restore<E: ProcessEnvironment>(env: &E, installed: InstalledSignals) -> DaemonResult<()> {
    let mut first_error = None;
    for saved in installed.saved.into_iter().rev() {
        let signal = saved.signal();
        if let Err(source) = env.restore_signal(saved) {
            warn!(signal, error = %source, "failed to restore signal disposition");
            first_error.get_or_insert(DaemonError::Signal { signal, source });
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
