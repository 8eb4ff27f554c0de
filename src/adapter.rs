//! Translates `fuser`'s low-level filesystem callbacks into [`Command`]s sent
//! across the [`RequestQueue`] to the supervisor thread, and maps its
//! `Result<_, Errno>` replies back onto the FUSE reply types.
//!
//! Owns no daemon state itself: only an inode table mapping FUSE inode
//! numbers to supervisor paths, and a per-open-file-handle scratch buffer
//! used to stitch partial-offset reads/writes into whole-file round-trips,
//! mirroring how `fuser`'s own channel/session split keeps protocol framing
//! separate from filesystem semantics.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    Errno, FileAttr, FileHandle, FileType, Filesystem, Generation, INodeNo, KernelConfig,
    LockOwner, OpenFlags, ReadFlags, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow, WriteFlags,
};
use log::warn;
use nix::unistd::{getgid, getuid};
use parking_lot::Mutex;

use crate::command::{Attr, Command, CommandOutput, EntryKind};
use crate::queue::RequestQueue;

const TTL: Duration = Duration::ZERO; // daemon state is live; never let the kernel cache it.

struct InodeTable {
    paths: Vec<String>,
    by_path: HashMap<String, u64>,
}

impl InodeTable {
    fn new() -> Self {
        Self {
            paths: vec![String::new()],
            by_path: HashMap::from([(String::new(), INodeNo::ROOT.into())]),
        }
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get((ino - 1) as usize).map(String::as_str)
    }

    fn ino_of(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        self.paths.push(path.to_string());
        let ino = self.paths.len() as u64;
        self.by_path.insert(path.to_string(), ino);
        ino
    }
}

/// An open file's local scratch buffer. Populated in full on `open`, flushed
/// in full on `release` if it was ever written to.
struct OpenFile {
    path: String,
    data: Vec<u8>,
    dirty: bool,
}

/// `fuser::Filesystem` adapter. `Send + Sync` because `fuser` may call it
/// from multiple worker threads; all shared state is behind `Mutex`es or
/// atomics.
pub struct SupervisorFs {
    queue: Arc<RequestQueue>,
    inodes: Mutex<InodeTable>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl SupervisorFs {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        Self {
            queue,
            inodes: Mutex::new(InodeTable::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }

    fn path_of(&self, ino: INodeNo) -> Option<String> {
        self.inodes.lock().path_of(ino.into()).map(str::to_string)
    }

    fn child_path(parent: &str, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        Some(if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        })
    }

    fn to_file_attr(&self, ino: u64, attr: Attr) -> FileAttr {
        let (kind, perm, nlink) = match attr.kind {
            EntryKind::Directory => (FileType::Directory, 0o755, 2),
            EntryKind::File { writable: true } => (FileType::RegularFile, 0o644, 1),
            EntryKind::File { writable: false } => (FileType::RegularFile, 0o444, 1),
        };
        FileAttr {
            ino: INodeNo(ino),
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.changed,
            mtime: attr.changed,
            ctime: attr.changed,
            crtime: attr.created,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn getattr_command(&self, path: &str) -> Result<Attr, Errno> {
        match self.queue.remote_command(Command::GetAttr { path: path.to_string() })? {
            CommandOutput::Attr(attr) => Ok(attr),
            _ => Err(Errno::EIO),
        }
    }

    fn readdir_command(&self, path: &str) -> Result<Vec<String>, Errno> {
        match self.queue.remote_command(Command::ReadDir { path: path.to_string() })? {
            CommandOutput::Entries(entries) => Ok(entries.into_iter().map(|e| e.name).collect()),
            _ => Err(Errno::EIO),
        }
    }

    fn read_command(&self, path: &str) -> Result<Vec<u8>, Errno> {
        match self.queue.remote_command(Command::Read { path: path.to_string() })? {
            CommandOutput::Data(data) => Ok(data),
            _ => Err(Errno::EIO),
        }
    }

    fn write_command(&self, path: &str, data: Vec<u8>) -> Result<(), Errno> {
        self.queue
            .remote_command(Command::Write { path: path.to_string(), data })
            .map(|_| ())
    }

    fn flush_handle(&self, fh: u64) {
        let entry = self.open_files.lock().remove(&fh);
        if let Some(open) = entry {
            if open.dirty {
                if let Err(e) = self.write_command(&open.path, open.data) {
                    warn!("{}: flush on release failed: {e}", open.path);
                }
            }
        }
    }
}

impl Filesystem for SupervisorFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(path) = Self::child_path(&parent_path, name) else {
            reply.error(Errno::EINVAL);
            return;
        };
        match self.getattr_command(&path) {
            Ok(attr) => {
                let ino = self.inodes.lock().ino_of(&path);
                reply.entry(&TTL, &self.to_file_attr(ino, attr), Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.getattr_command(&path) {
            Ok(attr) => reply.attr(&TTL, &self.to_file_attr(ino.into(), attr)),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<fuser::BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if let Some(new_size) = size {
            let result = self
                .queue
                .remote_command(Command::Truncate { path: path.clone(), offset: new_size });
            if let Err(e) = result {
                reply.error(e);
                return;
            }
        }
        match self.getattr_command(&path) {
            Ok(attr) => reply.attr(&TTL, &self.to_file_attr(ino.into(), attr)),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(path) = Self::child_path(&parent_path, name) else {
            reply.error(Errno::EINVAL);
            return;
        };
        if let Err(e) = self.queue.remote_command(Command::MakeDir { path: path.clone() }) {
            reply.error(e);
            return;
        }
        match self.getattr_command(&path) {
            Ok(attr) => {
                let ino = self.inodes.lock().ino_of(&path);
                reply.entry(&TTL, &self.to_file_attr(ino, attr), Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(path) = Self::child_path(&parent_path, name) else {
            reply.error(Errno::EINVAL);
            return;
        };
        match self.queue.remote_command(Command::RemoveDir { path }) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let contents = match self.read_command(&path) {
            Ok(data) => data,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().insert(fh, OpenFile { path, data: contents, dirty: false });
        reply.opened(FileHandle(fh), fuser::FopenFlags::FOPEN_DIRECT_IO);
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let files = self.open_files.lock();
        let Some(open) = files.get(&fh.into()) else {
            reply.error(Errno::EBADF);
            return;
        };
        let start = (offset as usize).min(open.data.len());
        let end = start.saturating_add(size as usize).min(open.data.len());
        reply.data(&open.data[start..end]);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let mut files = self.open_files.lock();
        let Some(open) = files.get_mut(&fh.into()) else {
            reply.error(Errno::EBADF);
            return;
        };
        let offset = offset as usize;
        if open.data.len() < offset + data.len() {
            open.data.resize(offset + data.len(), 0);
        }
        open.data[offset..offset + data.len()].copy_from_slice(data);
        open.dirty = true;
        reply.written(data.len() as u32);
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.flush_handle(fh.into());
        reply.ok();
    }

    fn opendir(&self, _req: &Request, _ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        reply.opened(FileHandle(0), fuser::FopenFlags::empty());
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let names = match self.readdir_command(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut entries = vec![(ino.into(), FileType::Directory, ".".to_string())];
        entries.push((ino.into(), FileType::Directory, "..".to_string()));
        for name in names {
            let child = Self::child_path(&path, OsStr::new(&name)).unwrap_or(name.clone());
            let child_ino = self.inodes.lock().ino_of(&child);
            let kind = if path.is_empty() { FileType::Directory } else { FileType::RegularFile };
            entries.push((child_ino, kind, name));
        }

        for (i, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(INodeNo(child_ino), (i + 1) as u64, kind, OsStr::new(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}
