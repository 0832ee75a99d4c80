// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FUSE node adaptor
//!
//! Maps kernel FUSE operations onto the handler registry. The adaptor owns
//! the inode <-> path tables so repeated lookups return stable inodes, and
//! builds one handler request per operation from the FUSE header. Lookups
//! are answered with the dentry-cache timeout so the kernel can keep
//! entries without re-querying.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, FUSE_ROOT_ID,
};
use fuser::consts::FOPEN_DIRECT_IO;
use libc::{c_int, ENOENT};
use std::sync::Arc;
use tracing::debug;

use shimfs_core::{FsError, HandlerRequest, HandlerService, IoNode};
use shimfs_proto::FileInfo;

/// Entries shown at the filesystem root; everything else the host root
/// carries stays hidden.
const ROOT_ENTRIES: [&str; 3] = ["sys", "proc", "testing"];

/// Default dentry-cache timeout, in minutes.
pub const DENTRY_CACHE_TIMEOUT_MINS: u64 = 5;

#[derive(Clone)]
struct NodeEntry {
    path: String,
    name: String,
    is_dir: bool,
}

pub struct ShimFs {
    service: Arc<HandlerService>,
    entry_ttl: Duration,
    attr_ttl: Duration,
    inodes: HashMap<u64, NodeEntry>,
    paths: HashMap<String, u64>,
    next_ino: u64,
    open_nodes: HashMap<u64, IoNode>,
    next_fh: u64,
}

/// Join a directory path and a child name.
fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether a directory entry is visible at the given path.
fn entry_visible(dir: &str, name: &str) -> bool {
    dir != "/" || ROOT_ENTRIES.contains(&name)
}

fn file_type(info: &FileInfo) -> FileType {
    if info.is_dir {
        FileType::Directory
    } else if info.mode & libc::S_IFMT == libc::S_IFLNK {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn epoch_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn errno(err: &FsError) -> c_int {
    err.errno() as c_int
}

impl ShimFs {
    pub fn new(service: Arc<HandlerService>, dentry_timeout: Duration) -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(
            FUSE_ROOT_ID,
            NodeEntry {
                path: "/".to_string(),
                name: String::new(),
                is_dir: true,
            },
        );
        paths.insert("/".to_string(), FUSE_ROOT_ID);

        Self {
            service,
            entry_ttl: dentry_timeout,
            attr_ttl: Duration::from_secs(1),
            inodes,
            paths,
            next_ino: FUSE_ROOT_ID + 1,
            open_nodes: HashMap::new(),
            next_fh: 1,
        }
    }

    /// Stable inode for a path; allocates on first sight.
    fn ino_for(&mut self, path: &str, name: &str, is_dir: bool) -> u64 {
        if let Some(ino) = self.paths.get(path) {
            // Refresh the cached shape; a path can change type across
            // container lifecycles.
            if let Some(entry) = self.inodes.get_mut(ino) {
                entry.is_dir = is_dir;
            }
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(
            ino,
            NodeEntry {
                path: path.to_string(),
                name: name.to_string(),
                is_dir,
            },
        );
        self.paths.insert(path.to_string(), ino);
        ino
    }

    fn entry(&self, ino: u64) -> Option<NodeEntry> {
        self.inodes.get(&ino).cloned()
    }

    /// Handler request built from the FUSE header, with the originating
    /// container resolved.
    fn handler_request(&self, req: &Request) -> HandlerRequest {
        let mut request = HandlerRequest::new(req.pid(), req.uid(), req.gid());
        request.id = req.unique();
        request.container = self
            .service
            .container_for_request(req.pid(), req.uid(), req.gid());
        request
    }

    fn attr_from_info(&self, info: &FileInfo, ino: u64) -> FileAttr {
        let kind = file_type(info);
        let mode = if info.stat.mode != 0 {
            info.stat.mode
        } else {
            info.mode
        };
        let perm = (mode & 0o7777) as u16;
        FileAttr {
            ino,
            size: info.size.max(0) as u64,
            blocks: 0,
            atime: epoch_secs(info.mod_time),
            mtime: epoch_secs(info.mod_time),
            ctime: epoch_secs(info.mod_time),
            crtime: epoch_secs(info.mod_time),
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: info.stat.uid,
            gid: info.stat.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn synthetic_attr(&self, ino: u64, is_dir: bool, uid: u32, gid: u32) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: if is_dir { 0o755 } else { 0o644 },
            nlink: if is_dir { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Attributes for an already-known node, honouring the handler's
    /// synthesized ownership when it provides one.
    fn attr_for(&mut self, entry: &NodeEntry, request: &HandlerRequest, ino: u64) -> FileAttr {
        let handler = match self.service.lookup_handler(&entry.path) {
            Ok(handler) => handler,
            Err(_) => return self.synthetic_attr(ino, entry.is_dir, 0, 0),
        };
        let node = self.service.io().new_node(&entry.name, &entry.path);

        match handler.getattr(&node, request) {
            Ok(Some(stat)) => {
                let mut attr = self.synthetic_attr(ino, entry.is_dir, stat.uid, stat.gid);
                if stat.mode & 0o7777 != 0 {
                    attr.perm = (stat.mode & 0o7777) as u16;
                }
                attr
            }
            Ok(None) => match handler.lookup(&node, request) {
                Ok(info) => self.attr_from_info(&info, ino),
                Err(_) => self.synthetic_attr(ino, entry.is_dir, 0, 0),
            },
            Err(_) => self.synthetic_attr(ino, entry.is_dir, 0, 0),
        }
    }
}

impl Filesystem for ShimFs {
    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_entry = match self.entry(parent) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let name = name.to_string_lossy().into_owned();
        let path = join_child(&parent_entry.path, &name);

        if !entry_visible(&parent_entry.path, &name) {
            reply.error(ENOENT);
            return;
        }

        debug!(target: "shimfs::fuse", %path, "lookup");

        let handler = match self.service.lookup_handler(&path) {
            Ok(handler) => handler,
            Err(_) => {
                reply.error(ENOENT);
                return;
            }
        };

        let request = self.handler_request(req);
        let node = self.service.io().new_node(&name, &path);

        match handler.lookup(&node, &request) {
            Ok(info) => {
                let ino = self.ino_for(&path, &name, info.is_dir);
                let attr = self.attr_from_info(&info, ino);
                reply.entry(&self.entry_ttl, &attr, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        if ino == FUSE_ROOT_ID {
            let attr = self.synthetic_attr(ino, true, 0, 0);
            reply.attr(&self.attr_ttl, &attr);
            return;
        }

        let request = self.handler_request(req);
        let attr = self.attr_for(&entry, &request, ino);
        reply.attr(&self.attr_ttl, &attr);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let handler = match self.service.lookup_handler(&entry.path) {
            Ok(handler) => handler,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let request = self.handler_request(req);
        let mut node = self.service.io().new_node(&entry.name, &entry.path);
        if size == Some(0) {
            node.set_open_flags(libc::O_WRONLY | libc::O_TRUNC);
        }

        match handler.setattr(&node, &request) {
            Ok(()) => {
                let attr = self.attr_for(&entry, &request, ino);
                reply.attr(&self.attr_ttl, &attr);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        debug!(target: "shimfs::fuse", path = %entry.path, flags, "open");

        let handler = match self.service.lookup_handler(&entry.path) {
            Ok(handler) => handler,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let request = self.handler_request(req);
        let mut node = self.service.io().new_node(&entry.name, &entry.path);
        node.set_open_flags(flags);

        match handler.open(&mut node, &request) {
            Ok(()) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.open_nodes.insert(fh, node);
                reply.opened(fh, FOPEN_DIRECT_IO);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn read(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let handler = match self.service.lookup_handler(&entry.path) {
            Ok(handler) => handler,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let node = self
            .open_nodes
            .get(&fh)
            .cloned()
            .unwrap_or_else(|| self.service.io().new_node(&entry.name, &entry.path));

        let mut request = self.handler_request(req);
        request.offset = offset.max(0) as u64;
        request.data = vec![0u8; size as usize];

        match handler.read(&node, &mut request) {
            Ok(n) => reply.data(&request.data[..n]),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn write(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let handler = match self.service.lookup_handler(&entry.path) {
            Ok(handler) => handler,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let node = self
            .open_nodes
            .get(&fh)
            .cloned()
            .unwrap_or_else(|| self.service.io().new_node(&entry.name, &entry.path));

        let mut request = self.handler_request(req);
        request.offset = offset.max(0) as u64;
        request.data = data.to_vec();

        match handler.write(&node, &mut request) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let node = self.open_nodes.remove(&fh);

        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.ok();
                return;
            }
        };

        if let (Some(node), Ok(handler)) = (node, self.service.lookup_handler(&entry.path)) {
            if let Err(err) = handler.close(&node) {
                reply.error(errno(&err));
                return;
            }
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        debug!(target: "shimfs::fuse", path = %entry.path, "readdir");

        let handler = match self.service.lookup_handler(&entry.path) {
            Ok(handler) => handler,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let request = self.handler_request(req);
        let node = self.service.io().new_node(&entry.name, &entry.path);

        let entries = match handler.read_dir_all(&node, &request) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let dir_path = entry.path.clone();
        let visible: Vec<FileInfo> = entries
            .into_iter()
            .filter(|info| entry_visible(&dir_path, &info.name))
            .collect();

        for (i, info) in visible.iter().enumerate().skip(offset.max(0) as usize) {
            let child_path = join_child(&dir_path, &info.name);
            let child_ino = self.ino_for(&child_path, &info.name, info.is_dir);
            if reply.add(child_ino, (i + 1) as i64, file_type(info), &info.name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_entry = match self.entry(parent) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        let name = name.to_string_lossy().into_owned();
        let path = join_child(&parent_entry.path, &name);

        let handler = match self.service.lookup_handler(&path) {
            Ok(handler) => handler,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let request = self.handler_request(req);
        let mut node = self.service.io().new_node(&name, &path);
        node.set_open_flags(flags);
        node.set_open_mode(mode);

        if let Err(err) = handler.open(&mut node, &request) {
            reply.error(errno(&err));
            return;
        }

        match handler.lookup(&node, &request) {
            Ok(info) => {
                let ino = self.ino_for(&path, &name, info.is_dir);
                let attr = self.attr_from_info(&info, ino);
                let fh = self.next_fh;
                self.next_fh += 1;
                self.open_nodes.insert(fh, node);
                reply.created(&self.entry_ttl, &attr, 0, fh, FOPEN_DIRECT_IO);
            }
            Err(_) => reply.error(ENOENT),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let entry = match self.entry(ino) {
            Some(entry) => entry,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        // Evaluate the request against the caller's own root and
        // credentials, exactly as the kernel would inside the container.
        let process = self
            .service
            .process()
            .create(req.pid(), req.uid(), req.gid());
        match process.path_access(&entry.path, mask.max(0) as u32) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn flush(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }
}
