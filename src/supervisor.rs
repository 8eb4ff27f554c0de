//! The single-threaded event loop that owns every [`Daemon`], multiplexing
//! child output against incoming filesystem commands via epoll.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::signal::{
    kill, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, read, Pid};

use crate::command::{Attr, Command, CommandOutput, DirEntry, EntryKind};
use crate::daemon::{Daemon, State, RESTART_GRACE};
use crate::queue::RequestQueue;

/// Sentinel epoll-data value identifying the queue's wakeup fd, distinct
/// from any `(slot_index << 1) | is_stderr` daemon tag.
const WAKEUP_TAG: u64 = u64::MAX;
const READ_CHUNK: usize = 4096;

static SIGCHLD_COUNT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_sigchld(_: libc::c_int) {
    SIGCHLD_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Owns every [`Daemon`] by stable slot index (a freed slot becomes `None`
/// and may be reused, so indices already registered with epoll never shift),
/// the epoll instance, and the running flag.
pub struct Supervisor {
    daemons: Vec<Option<Daemon>>,
    epoll: Epoll,
    queue: Arc<RequestQueue>,
    running: bool,
    verbose: bool,
    created: SystemTime,
}

impl Supervisor {
    pub fn new(queue: Arc<RequestQueue>, verbose: bool) -> nix::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(queue.wakeup_fd(), EpollEvent::new(EpollFlags::EPOLLIN, WAKEUP_TAG))?;

        block_sigchld()?;
        install_sigchld_handler()?;
        ignore_sigpipe()?;

        Ok(Self {
            daemons: Vec::new(),
            epoll,
            queue,
            running: true,
            verbose,
            created: SystemTime::now(),
        })
    }

    /// Injects the `bootstrap` oneshot daemon (§4.D.3) and starts it.
    pub fn bootstrap(&mut self, exe: String) {
        let idx = self.alloc_slot();
        self.daemons[idx] = Some(Daemon::oneshot("bootstrap".to_string(), exe));
        if let Err(e) = self.start_daemon(idx) {
            warn!("bootstrap daemon failed to start: {e}");
        }
    }

    /// Runs the main loop until a `Quit` command clears the running flag.
    pub fn run(&mut self) {
        while self.running {
            self.step();
        }
    }

    fn step(&mut self) {
        if let Some(event) = wait_one(self.epoll.as_raw_fd()) {
            if event.u64 == WAKEUP_TAG {
                self.drain_queue();
            } else {
                self.handle_daemon_event(event.u64, event.events);
            }
        }
        self.drain_sigchld();
    }

    fn drain_queue(&mut self) {
        self.queue.drain_wakeup();
        for request in self.queue.swap() {
            let result = self.dispatch(request.command);
            request.completion.complete(result);
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<CommandOutput, Errno> {
        match command {
            Command::GetAttr { path } => self.getattr(&path),
            Command::MakeDir { path } => self.mkdir(&path),
            Command::RemoveDir { path } => self.rmdir(&path),
            Command::ReadDir { path } => self.readdir(&path),
            Command::Truncate { path, offset } => self.truncate(&path, offset),
            Command::Read { path } => self.read(&path),
            Command::Write { path, data } => self.write(&path, &data),
            Command::Quit => {
                self.running = false;
                Ok(CommandOutput::Unit)
            }
        }
    }

    fn getattr(&self, path: &str) -> Result<CommandOutput, Errno> {
        match split(path).as_slice() {
            [] => Ok(CommandOutput::Attr(Attr {
                kind: EntryKind::Directory,
                size: 0,
                created: self.created,
                changed: self.created,
            })),
            [name] => {
                let idx = self.find(name).ok_or(Errno::ENOENT)?;
                let d = self.daemon(idx);
                Ok(CommandOutput::Attr(Attr {
                    kind: EntryKind::Directory,
                    size: 0,
                    created: d.created,
                    changed: d.created,
                }))
            }
            [name, file] => {
                let idx = self.find(name).ok_or(Errno::ENOENT)?;
                self.daemon(idx).getattr(file).map(CommandOutput::Attr)
            }
            _ => Err(Errno::ENOENT),
        }
    }

    fn mkdir(&mut self, path: &str) -> Result<CommandOutput, Errno> {
        let parts = split(path);
        let [name] = parts.as_slice() else {
            return Err(Errno::EINVAL);
        };
        if self.find(name).is_some() {
            return Err(Errno::EEXIST);
        }
        let idx = self.alloc_slot();
        self.daemons[idx] = Some(Daemon::new((*name).to_string()));
        Ok(CommandOutput::Unit)
    }

    fn rmdir(&mut self, path: &str) -> Result<CommandOutput, Errno> {
        let parts = split(path);
        let [name] = parts.as_slice() else {
            return Err(Errno::EINVAL);
        };
        let idx = self.find(name).ok_or(Errno::ENOENT)?;
        if matches!(self.daemon(idx).state, State::Up | State::WantDown) {
            return Err(Errno::EBUSY);
        }
        self.daemons[idx] = None;
        Ok(CommandOutput::Unit)
    }

    fn readdir(&self, path: &str) -> Result<CommandOutput, Errno> {
        match split(path).as_slice() {
            [] => {
                let entries = self
                    .daemons
                    .iter()
                    .flatten()
                    .map(|d| DirEntry { name: d.name.clone() })
                    .collect();
                Ok(CommandOutput::Entries(entries))
            }
            [name] => {
                let idx = self.find(name).ok_or(Errno::ENOENT)?;
                Ok(CommandOutput::Entries(self.daemon(idx).readdir()))
            }
            _ => Err(Errno::ENOENT),
        }
    }

    fn truncate(&mut self, path: &str, offset: u64) -> Result<CommandOutput, Errno> {
        let parts = split(path);
        let [name, file] = parts.as_slice() else {
            return Err(Errno::ENOENT);
        };
        let idx = self.find(name).ok_or(Errno::ENOENT)?;
        self.daemon_mut(idx).truncate(file, offset)?;
        Ok(CommandOutput::Unit)
    }

    fn read(&self, path: &str) -> Result<CommandOutput, Errno> {
        let parts = split(path);
        let [name, file] = parts.as_slice() else {
            return Err(Errno::ENOENT);
        };
        let idx = self.find(name).ok_or(Errno::ENOENT)?;
        self.daemon(idx).read(file).map(CommandOutput::Data)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<CommandOutput, Errno> {
        let parts = split(path);
        let [name, file] = parts.as_slice() else {
            return Err(Errno::ENOENT);
        };
        let idx = self.find(name).ok_or(Errno::ENOENT)?;
        match *file {
            "state" => self.write_state(idx, data)?,
            "args" => self.daemon_mut(idx).write_args(data)?,
            _ => return Err(Errno::ENOENT),
        }
        Ok(CommandOutput::Unit)
    }

    fn write_state(&mut self, idx: usize, data: &[u8]) -> Result<(), Errno> {
        let text = std::str::from_utf8(data).map_err(|_| Errno::EINVAL)?;
        let text = text.strip_suffix('\n').unwrap_or(text);
        match text {
            "up" => {
                if !matches!(self.daemon(idx).state, State::Down | State::Fail) {
                    return Err(Errno::EINVAL);
                }
                self.start_daemon(idx)
            }
            "down" => {
                if self.daemon(idx).state != State::Up {
                    return Err(Errno::EINVAL);
                }
                let pid = self.daemon(idx).child.as_ref().map(|c| c.pid);
                self.daemon_mut(idx).set_state(State::WantDown);
                if let Some(pid) = pid {
                    let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGTERM);
                }
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn start_daemon(&mut self, idx: usize) -> Result<(), Errno> {
        if !self.daemon_mut(idx).start_process() {
            return Err(Errno::EIO);
        }
        self.daemon_mut(idx).set_state(State::Up);
        let (stdout_fd, stderr_fd) = {
            let child = self.daemon(idx).child.as_ref().expect("just spawned");
            (child.stdout_fd.as_raw_fd(), child.stderr_fd.as_raw_fd())
        };
        self.register_fd(stdout_fd, (idx as u64) << 1)
            .map_err(|_| Errno::EIO)?;
        self.register_fd(stderr_fd, ((idx as u64) << 1) | 1)
            .map_err(|_| Errno::EIO)?;
        Ok(())
    }

    fn register_fd(&self, fd: RawFd, tag: u64) -> nix::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, tag))
    }

    fn handle_daemon_event(&mut self, tag: u64, events: u32) {
        let idx = (tag >> 1) as usize;
        let is_stderr = tag & 1 == 1;
        let Some(fd) = self.daemons.get(idx).and_then(|d| d.as_ref()).and_then(|d| {
            d.child.as_ref().map(|c| {
                if is_stderr {
                    c.stderr_fd.as_raw_fd()
                } else {
                    c.stdout_fd.as_raw_fd()
                }
            })
        }) else {
            return;
        };
        let name = self.daemon(idx).name.clone();

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match read(fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if self.verbose {
                        debug!("{name}: {}", String::from_utf8_lossy(&chunk[..n]));
                    }
                    let daemon = self.daemon_mut(idx);
                    if is_stderr {
                        daemon.stderr_buf.write(&chunk[..n]);
                    } else {
                        daemon.stdout_buf.write(&chunk[..n]);
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    warn!("{name}: read failed: {e}");
                    break;
                }
            }
        }
        if events & (libc::EPOLLHUP as u32) != 0 {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = self.epoll.delete(borrowed) {
                error!("epoll_ctl(DEL) failed for a registered fd: {e}");
                panic!("epoll_ctl(DEL) failed for a registered fd: {e}");
            }
            let _ = close(fd);
        }
    }

    fn drain_sigchld(&mut self) {
        let pending = SIGCHLD_COUNT.swap(0, Ordering::SeqCst);
        for _ in 0..pending {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.reap(pid, format!("exited with status {code}"))
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.reap(pid, format!("killed by signal {sig:?}"))
                }
                Ok(WaitStatus::StillAlive) => {
                    warn!("SIGCHLD fired but no process was available to reap");
                }
                Ok(_) => {}
                Err(e) => warn!("waitpid: {e}"),
            }
        }
    }

    fn reap(&mut self, pid: Pid, reason: String) {
        let Some(idx) = self.daemons.iter().position(|d| {
            d.as_ref()
                .and_then(|d| d.child.as_ref())
                .map(|c| c.pid == pid)
                .unwrap_or(false)
        }) else {
            error!("reaped unknown pid {pid}: {reason}");
            panic!("reaped unknown pid {pid}: {reason}");
        };

        info!("{}: {reason}", self.daemon(idx).name);
        self.unregister_daemon_fds(idx);

        let daemon = self.daemon_mut(idx);
        daemon.child = None;
        let was_want_down = daemon.state == State::WantDown;
        let oneshot = daemon.oneshot;
        let uptime = daemon.time_in_state();

        if oneshot || was_want_down {
            self.daemon_mut(idx).set_state(State::Down);
        } else if uptime < RESTART_GRACE {
            self.daemon_mut(idx).set_state(State::Fail);
        } else if let Err(e) = self.start_daemon(idx) {
            warn!("{}: restart failed: {e}", self.daemon(idx).name);
            self.daemon_mut(idx).set_state(State::Fail);
        }
    }

    fn unregister_daemon_fds(&mut self, idx: usize) {
        let fds = self
            .daemons
            .get(idx)
            .and_then(|d| d.as_ref())
            .and_then(|d| d.child.as_ref())
            .map(|c| (c.stdout_fd.as_raw_fd(), c.stderr_fd.as_raw_fd()));
        if let Some((stdout_fd, stderr_fd)) = fds {
            for fd in [stdout_fd, stderr_fd] {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                if let Err(e) = self.epoll.delete(borrowed) {
                    error!("epoll_ctl(DEL) failed for a registered fd: {e}");
                    panic!("epoll_ctl(DEL) failed for a registered fd: {e}");
                }
                let _ = close(fd);
            }
        }
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(idx) = self.daemons.iter().position(Option::is_none) {
            idx
        } else {
            self.daemons.push(None);
            self.daemons.len() - 1
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.daemons
            .iter()
            .position(|d| d.as_ref().map(|d| d.name == name).unwrap_or(false))
    }

    fn daemon(&self, idx: usize) -> &Daemon {
        self.daemons[idx].as_ref().expect("stable slot index")
    }

    fn daemon_mut(&mut self, idx: usize) -> &mut Daemon {
        self.daemons[idx].as_mut().expect("stable slot index")
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Blocking `epoll_pwait(2)` call with an empty signal mask, so SIGCHLD is
/// unblocked for the duration of the wait and nowhere else. Retrieves at
/// most one event per call, matching the supervisor's one-event-per-turn
/// iteration.
fn wait_one(epoll_fd: RawFd) -> Option<libc::epoll_event> {
    let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut mask) };
    let n = unsafe { libc::epoll_pwait(epoll_fd, &mut event, 1, -1, &mask) };
    if n <= 0 {
        None
    } else {
        Some(event)
    }
}

fn block_sigchld() -> nix::Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
}

/// Installs a handler that only bumps an atomic counter — no signal-unsafe
/// work runs in signal context.
fn install_sigchld_handler() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_sigchld), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGCHLD, &action) }.map(|_| ())
}

/// Writes to an exited child's closed stdin/stdout pipes must not kill the
/// supervisor.
fn ignore_sigpipe() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &action) }.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<RequestQueue> {
        Arc::new(RequestQueue::new().expect("eventfd"))
    }

    #[test]
    fn mkdir_then_getattr_then_rmdir() {
        let mut sup = Supervisor::new(queue(), false).expect("supervisor");
        assert!(matches!(sup.mkdir("svc"), Ok(CommandOutput::Unit)));
        assert!(matches!(sup.mkdir("svc"), Err(Errno::EEXIST)));
        assert!(matches!(sup.getattr("svc"), Ok(CommandOutput::Attr(_))));
        assert!(matches!(sup.rmdir("svc"), Ok(CommandOutput::Unit)));
        assert!(matches!(sup.getattr("svc"), Err(Errno::ENOENT)));
    }

    #[test]
    fn rmdir_unknown_daemon_is_enoent() {
        let mut sup = Supervisor::new(queue(), false).expect("supervisor");
        assert_eq!(sup.rmdir("ghost"), Err(Errno::ENOENT));
    }

    #[test]
    fn write_args_then_read_back_through_supervisor() {
        let mut sup = Supervisor::new(queue(), false).expect("supervisor");
        sup.mkdir("svc").unwrap();
        sup.write("svc/args", b"/bin/true").unwrap();
        let CommandOutput::Data(contents) = sup.read("svc/args").unwrap() else {
            panic!("expected Data");
        };
        assert_eq!(contents, b"/bin/true\n".to_vec());
        let CommandOutput::Data(state) = sup.read("svc/state").unwrap() else {
            panic!("expected Data");
        };
        assert_eq!(state, b"down".to_vec());
    }

    #[test]
    fn reused_slot_keeps_other_indices_stable() {
        let mut sup = Supervisor::new(queue(), false).expect("supervisor");
        sup.mkdir("a").unwrap();
        sup.mkdir("b").unwrap();
        let b_idx = sup.find("b").unwrap();
        sup.rmdir("a").unwrap();
        sup.mkdir("c").unwrap();
        // "c" reuses "a"'s freed slot; "b" must not have moved.
        assert_eq!(sup.find("b"), Some(b_idx));
    }

    #[test]
    fn write_state_up_rejected_before_args() {
        let mut sup = Supervisor::new(queue(), false).expect("supervisor");
        sup.mkdir("svc").unwrap();
        assert_eq!(sup.write("svc/state", b"up"), Err(Errno::EINVAL));
    }
}
