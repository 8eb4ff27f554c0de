//! The multi-producer, single-consumer mailbox that carries [`Request`]s
//! from `fuser` worker threads to the supervisor thread.
//!
//! Producers never talk to the supervisor directly: they push a request
//! under a short critical section, ping an eventfd so the supervisor's
//! `epoll_wait` wakes up, and then block on the request's own completion
//! handle. The supervisor drains the whole pending batch in one lock
//! acquisition (`swap`), matching the original's atomic swap-the-batch
//! design.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

use crate::command::{Command, CommandOutput, Completion, Request};
use nix::errno::Errno;
use std::sync::Arc;

/// Shared mailbox plus the eventfd used to wake the supervisor's epoll loop.
pub struct RequestQueue {
    pending: Mutex<Vec<Request>>,
    wakeup: EventFd,
}

impl RequestQueue {
    pub fn new() -> io::Result<Self> {
        let wakeup = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        Ok(Self {
            pending: Mutex::new(Vec::new()),
            wakeup,
        })
    }

    /// Borrowed fd for registering the wakeup eventfd with epoll.
    pub fn wakeup_fd(&self) -> BorrowedFd<'_> {
        self.wakeup.as_fd()
    }

    pub fn wakeup_raw_fd(&self) -> RawFd {
        self.wakeup.as_fd().as_raw_fd()
    }

    /// Drains the eventfd's counter so it stops reporting readable.
    pub fn drain_wakeup(&self) {
        let _ = self.wakeup.read();
    }

    /// Pushes a request and pings the wakeup fd. Called from producer
    /// (`fuser` worker) threads.
    fn push(&self, request: Request) {
        self.pending.lock().push(request);
        // One token is enough; the supervisor drains the whole batch per wakeup.
        let _ = self.wakeup.write(1);
    }

    /// Atomically swaps the pending batch for an empty one. Called from the
    /// supervisor thread only.
    pub fn swap(&self) -> Vec<Request> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Builds a request for `command`, enqueues it, and blocks until the
    /// supervisor has filled in a result. Safe to call concurrently from
    /// any number of threads; each call uses its own completion handle.
    pub fn remote_command(&self, command: Command) -> Result<CommandOutput, Errno> {
        let (request, completion) = Request::new(command);
        self.push(request);
        completion.wait()
    }
}

/// Convenience used by the supervisor when it wants to signal a request's
/// completion without going through `RequestQueue` (e.g. in tests that
/// construct `Request`/`Completion` directly).
pub fn complete(completion: &Arc<Completion>, result: Result<CommandOutput, Errno>) {
    completion.complete(result);
}
