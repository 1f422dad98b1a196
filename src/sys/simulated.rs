//! An in-memory process used by unit tests. It records every mutation the
//! daemon code asks for instead of applying it to the test runner.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Fork, Pid, ProcessEnvironment, SavedDisposition, Signal};
use crate::signal::SignalAction;
use crate::types::{Group, User};

/// Payload of the panic raised by [`SimulatedEnvironment::exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedExit(pub i32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Fork,
    CreateSession,
    PreventCore,
    ChangeRoot(PathBuf),
    ChangeDirectory(PathBuf),
    Umask(u32),
    SetGroup(u32),
    SetUser(u32),
    ChangeOwner(PathBuf),
    ProcessName(String),
    Flush,
    Duplicate { source: RawFd, target: RawFd },
    Close(RawFd),
    Kill(Pid, Signal),
    Wait(Pid),
    Exit(i32),
    Ready,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Original,
    Ignored,
    Default,
    Terminate,
    Flag,
    Custom,
}

struct State {
    pid: Pid,
    parent: Pid,
    next_pid: Pid,
    forks: VecDeque<io::Result<Fork>>,
    session_leader: bool,
    terminal: bool,
    stdin_socket: bool,
    supervised: bool,
    live: HashSet<Pid>,
    foreign: HashSet<Pid>,
    exit_status: HashMap<Pid, i32>,
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
    fail_set_group: bool,
    fail_set_user: bool,
    fail_duplicate: HashSet<RawFd>,
    fail_signal: HashSet<Signal>,
    precise_descriptors: bool,
    descriptor_limit: RawFd,
    open_fds: BTreeSet<RawFd>,
    dispositions: HashMap<Signal, (SignalAction, Arc<AtomicBool>)>,
    umask: u32,
    events: Vec<Event>,
}

#[derive(Clone)]
pub struct SimulatedEnvironment {
    state: Rc<RefCell<State>>,
}

impl SimulatedEnvironment {
    /// A process `pid` attached to a terminal, with descriptors 0-2 and a few
    /// inherited ones open.
    pub fn new(pid: Pid) -> Self {
        let mut live = HashSet::new();
        live.insert(pid);
        let state = State {
            pid,
            parent: 1000,
            next_pid: pid + 1,
            forks: VecDeque::new(),
            session_leader: false,
            terminal: true,
            stdin_socket: false,
            supervised: false,
            live,
            foreign: HashSet::new(),
            exit_status: HashMap::new(),
            users: HashMap::from([("daemon".to_owned(), 2)]),
            groups: HashMap::from([("daemon".to_owned(), 2)]),
            fail_set_group: false,
            fail_set_user: false,
            fail_duplicate: HashSet::new(),
            fail_signal: HashSet::new(),
            precise_descriptors: true,
            descriptor_limit: 16,
            open_fds: BTreeSet::from([0, 1, 2, 5, 7, 9]),
            dispositions: HashMap::new(),
            umask: 0o022,
            events: Vec::new(),
        };
        SimulatedEnvironment {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Queues the outcome of the next fork. Without a script, forks land in the child.
    pub fn script_fork(&self, outcome: io::Result<Fork>) {
        self.state.borrow_mut().forks.push_back(outcome);
    }

    pub fn set_detached(&self) {
        let mut state = self.state.borrow_mut();
        state.terminal = false;
        state.session_leader = true;
    }

    pub fn set_parent(&self, pid: Pid) {
        self.state.borrow_mut().parent = pid;
    }

    pub fn set_stdin_socket(&self) {
        self.state.borrow_mut().stdin_socket = true;
    }

    pub fn set_supervised(&self) {
        self.state.borrow_mut().supervised = true;
    }

    pub fn add_live_process(&self, pid: Pid) {
        self.state.borrow_mut().live.insert(pid);
    }

    pub fn add_foreign_process(&self, pid: Pid) {
        self.state.borrow_mut().foreign.insert(pid);
    }

    pub fn kill_process(&self, pid: Pid) {
        self.state.borrow_mut().live.remove(&pid);
    }

    pub fn set_exit_status(&self, pid: Pid, status: i32) {
        self.state.borrow_mut().exit_status.insert(pid, status);
    }

    pub fn fail_set_group(&self) {
        self.state.borrow_mut().fail_set_group = true;
    }

    pub fn fail_set_user(&self) {
        self.state.borrow_mut().fail_set_user = true;
    }

    pub fn fail_duplicate(&self, target: RawFd) {
        self.state.borrow_mut().fail_duplicate.insert(target);
    }

    pub fn fail_signal(&self, signal: Signal) {
        self.state.borrow_mut().fail_signal.insert(signal);
    }

    pub fn without_descriptor_listing(&self) {
        self.state.borrow_mut().precise_descriptors = false;
    }

    pub fn set_descriptor_limit(&self, limit: RawFd) {
        self.state.borrow_mut().descriptor_limit = limit;
    }

    pub fn open_fds(&self) -> BTreeSet<RawFd> {
        self.state.borrow().open_fds.clone()
    }

    pub fn umask(&self) -> u32 {
        self.state.borrow().umask
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.state.borrow().events.iter().filter(|e| *e == event).count()
    }

    pub fn disposition(&self, signal: Signal) -> Disposition {
        match self.state.borrow().dispositions.get(&signal) {
            None => Disposition::Original,
            Some((SignalAction::Ignore, _)) => Disposition::Ignored,
            Some((SignalAction::Default, _)) => Disposition::Default,
            Some((SignalAction::Terminate, _)) => Disposition::Terminate,
            Some((SignalAction::Flag(_), _)) => Disposition::Flag,
            Some((SignalAction::Custom(_), _)) => Disposition::Custom,
        }
    }

    /// Runs the installed action for `signal` as if it had been delivered.
    pub fn deliver(&self, signal: Signal) {
        let installed = self.state.borrow().dispositions.get(&signal).cloned();
        match installed {
            Some((SignalAction::Terminate, shutdown)) => shutdown.store(true, Ordering::SeqCst),
            Some((SignalAction::Flag(flag), _)) => flag.store(true, Ordering::SeqCst),
            Some((SignalAction::Custom(handler), _)) => (handler.0)(),
            _ => {}
        }
    }

    fn record(&self, event: Event) {
        self.state.borrow_mut().events.push(event);
    }

    fn existence(&self, pid: Pid) -> io::Result<()> {
        let state = self.state.borrow();
        if state.live.contains(&pid) {
            Ok(())
        } else if state.foreign.contains(&pid) {
            Err(io::Error::from_raw_os_error(libc::EPERM))
        } else {
            Err(io::Error::from_raw_os_error(libc::ESRCH))
        }
    }
}

impl ProcessEnvironment for SimulatedEnvironment {
    fn pid(&self) -> Pid {
        self.state.borrow().pid
    }

    fn parent_pid(&self) -> Pid {
        self.state.borrow().parent
    }

    fn fork(&self) -> io::Result<Fork> {
        self.record(Event::Fork);
        let mut state = self.state.borrow_mut();
        let outcome = state.forks.pop_front().unwrap_or(Ok(Fork::Child));
        match outcome {
            Ok(Fork::Child) => {
                let child = state.next_pid;
                state.next_pid += 1;
                state.parent = state.pid;
                state.pid = child;
                state.live.insert(child);
                Ok(Fork::Child)
            }
            Ok(Fork::Parent(child)) => {
                state.live.insert(child);
                Ok(Fork::Parent(child))
            }
            Err(err) => Err(err),
        }
    }

    fn create_session(&self) -> io::Result<Pid> {
        self.record(Event::CreateSession);
        let mut state = self.state.borrow_mut();
        state.session_leader = true;
        state.terminal = false;
        Ok(state.pid)
    }

    fn is_session_leader(&self) -> bool {
        self.state.borrow().session_leader
    }

    fn has_controlling_terminal(&self) -> bool {
        self.state.borrow().terminal
    }

    fn stdin_is_socket(&self) -> bool {
        self.state.borrow().stdin_socket
    }

    fn supervised(&self) -> bool {
        self.state.borrow().supervised
    }

    fn wait_child(&self, pid: Pid) -> io::Result<i32> {
        self.record(Event::Wait(pid));
        self.state
            .borrow()
            .exit_status
            .get(&pid)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ECHILD))
    }

    fn exit(&self, code: i32) -> ! {
        self.record(Event::Exit(code));
        std::panic::panic_any(SimulatedExit(code))
    }

    fn exit_immediately(&self, code: i32) -> ! {
        self.exit(code)
    }

    fn prevent_core_dump(&self) -> io::Result<()> {
        self.record(Event::PreventCore);
        Ok(())
    }

    fn change_root(&self, path: &Path) -> io::Result<()> {
        self.record(Event::ChangeRoot(path.to_path_buf()));
        Ok(())
    }

    fn change_directory(&self, path: &Path) -> io::Result<()> {
        if !path.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.record(Event::ChangeDirectory(path.to_path_buf()));
        Ok(())
    }

    fn set_umask(&self, mask: u32) -> u32 {
        self.record(Event::Umask(mask));
        std::mem::replace(&mut self.state.borrow_mut().umask, mask)
    }

    fn resolve_user(&self, user: &User) -> io::Result<u32> {
        match user {
            User::Id(id) => Ok(*id),
            User::Name(name) => self
                .state
                .borrow()
                .users
                .get(name)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such user")),
        }
    }

    fn resolve_group(&self, group: &Group) -> io::Result<u32> {
        match group {
            Group::Id(id) => Ok(*id),
            Group::Name(name) => self
                .state
                .borrow()
                .groups
                .get(name)
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such group")),
        }
    }

    fn set_group(&self, gid: u32) -> io::Result<()> {
        if self.state.borrow().fail_set_group {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.record(Event::SetGroup(gid));
        Ok(())
    }

    fn set_user(&self, uid: u32) -> io::Result<()> {
        if self.state.borrow().fail_set_user {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.record(Event::SetUser(uid));
        Ok(())
    }

    fn change_owner(&self, path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
        self.record(Event::ChangeOwner(path.to_path_buf()));
        Ok(())
    }

    fn set_process_name(&self, name: &str) -> io::Result<()> {
        self.record(Event::ProcessName(name.to_owned()));
        Ok(())
    }

    fn flush_standard_streams(&self) {
        self.record(Event::Flush);
    }

    fn open_null_device(&self) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")?;
        Ok(OwnedFd::from(file))
    }

    fn duplicate_onto(&self, source: RawFd, target: RawFd) -> io::Result<()> {
        if self.state.borrow().fail_duplicate.contains(&target) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        self.record(Event::Duplicate { source, target });
        self.state.borrow_mut().open_fds.insert(target);
        Ok(())
    }

    fn open_descriptors(&self) -> Option<Vec<RawFd>> {
        let state = self.state.borrow();
        state
            .precise_descriptors
            .then(|| state.open_fds.iter().copied().collect())
    }

    fn descriptor_limit(&self) -> RawFd {
        self.state.borrow().descriptor_limit
    }

    /// Records every attempt, including ones that fail with `EBADF`.
    fn close_descriptor(&self, fd: RawFd) -> io::Result<()> {
        self.record(Event::Close(fd));
        if !self.state.borrow_mut().open_fds.remove(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }

    fn install_signal(
        &self,
        signal: Signal,
        action: &SignalAction,
        shutdown: &Arc<AtomicBool>,
    ) -> io::Result<SavedDisposition> {
        if self.state.borrow().fail_signal.contains(&signal) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.state
            .borrow_mut()
            .dispositions
            .insert(signal, (action.clone(), Arc::clone(shutdown)));
        Ok(SavedDisposition {
            signal,
            previous: None,
            hooks: Vec::new(),
        })
    }

    fn restore_signal(&self, saved: SavedDisposition) -> io::Result<()> {
        self.state.borrow_mut().dispositions.remove(&saved.signal);
        Ok(())
    }

    fn send_signal(&self, pid: Pid, signal: Signal) -> io::Result<()> {
        if signal != 0 {
            self.record(Event::Kill(pid, signal));
        }
        self.existence(pid)
    }

    fn notify_ready(&self) {
        self.record(Event::Ready);
    }

    fn notify_stopping(&self) {
        self.record(Event::Stopping);
    }
}
