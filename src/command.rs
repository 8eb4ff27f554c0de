//! The command protocol spoken between the FS adapter and the supervisor
//! thread: one [`Command`] per filesystem operation, carried across the
//! [`crate::queue::RequestQueue`] together with a [`Completion`] handle the
//! supervisor uses to hand the result back.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use nix::errno::Errno;

/// A directory entry yielded by a `ReadDir` command.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
}

/// Everything the supervisor needs to know to answer a `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File { writable: bool },
}

/// A `getattr` result: enough metadata for the FS adapter to build a
/// `fuser::FileAttr` without reaching back into daemon internals.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub created: std::time::SystemTime,
    pub changed: std::time::SystemTime,
}

/// One filesystem operation translated into the supervisor's own
/// vocabulary. Paths are always relative to the mount root, with no leading
/// slash (`""` for the root itself, `"name"` for a daemon directory,
/// `"name/file"` for a virtual file).
pub enum Command {
    GetAttr {
        path: String,
    },
    MakeDir {
        path: String,
    },
    RemoveDir {
        path: String,
    },
    ReadDir {
        path: String,
    },
    Truncate {
        path: String,
        offset: u64,
    },
    Read {
        path: String,
    },
    Write {
        path: String,
        data: Vec<u8>,
    },
    Quit,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetAttr { path } => write!(f, "GetAttr({path:?})"),
            Command::MakeDir { path } => write!(f, "MakeDir({path:?})"),
            Command::RemoveDir { path } => write!(f, "RemoveDir({path:?})"),
            Command::ReadDir { path } => write!(f, "ReadDir({path:?})"),
            Command::Truncate { path, offset } => write!(f, "Truncate({path:?}, {offset})"),
            Command::Read { path } => write!(f, "Read({path:?})"),
            Command::Write { path, data } => write!(f, "Write({path:?}, {} bytes)", data.len()),
            Command::Quit => write!(f, "Quit"),
        }
    }
}

/// The value a command resolves to on success, specific to its kind.
#[derive(Debug)]
pub enum CommandOutput {
    Unit,
    Attr(Attr),
    Entries(Vec<DirEntry>),
    Data(Vec<u8>),
}

/// A one-shot completion handle shared between a producer thread (blocked in
/// `remote_command`) and the supervisor thread (which fills in the result
/// and wakes the waiter). Plays the role the original's `Event` +
/// result-slot pair played, built from `std::sync::{Mutex, Condvar}` the way
/// the teacher crate's own multi-threaded session path signals completion.
pub struct Completion {
    state: Mutex<Option<Result<CommandOutput, Errno>>>,
    ready: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Fills in the result and wakes the waiting producer. Called exactly
    /// once, from the supervisor thread.
    pub fn complete(&self, result: Result<CommandOutput, Errno>) {
        let mut guard = self.state.lock().unwrap();
        *guard = Some(result);
        self.ready.notify_one();
    }

    /// Blocks until `complete` has been called, then returns its result.
    pub fn wait(&self) -> Result<CommandOutput, Errno> {
        let mut guard = self.state.lock().unwrap();
        while guard.is_none() {
            guard = self.ready.wait(guard).unwrap();
        }
        guard.take().expect("completion notified with no result")
    }
}

/// A command paired with the handle used to deliver its result.
pub struct Request {
    pub command: Command,
    pub completion: Arc<Completion>,
}

impl Request {
    pub fn new(command: Command) -> (Self, Arc<Completion>) {
        let completion = Arc::new(Completion::new());
        (
            Self {
                command,
                completion: completion.clone(),
            },
            completion,
        )
    }
}
