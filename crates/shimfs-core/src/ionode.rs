// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! IO-node abstraction over the host filesystem
//!
//! Handlers never touch `std::fs` directly; they operate on [`IoNode`]
//! values obtained from an [`IoService`]. The backend behind the service is
//! swappable: [`RealIo`] talks to the host filesystem and `/proc`, while
//! [`MemIo`] is a hash-map filesystem used by the test suites (namespace
//! inode files there carry the inode number as their content).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use shimfs_proto::{FileInfo, NsKind, StatData};

use crate::error::{FsError, FsResult};

/// Stat fields the core needs; a narrowed `struct stat`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStat {
    pub ino: u64,
    /// Full `st_mode`, file-type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
}

impl NodeStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn perm(&self) -> u32 {
        self.mode & 0o777
    }

    pub fn file_info(&self, name: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: self.size,
            mode: self.mode,
            mod_time: self.mtime,
            is_dir: self.is_dir(),
            stat: StatData {
                ino: self.ino,
                mode: self.mode,
                uid: self.uid,
                gid: self.gid,
            },
        }
    }
}

/// Filesystem backend behind the IO service.
pub trait IoBackend: Send + Sync {
    /// Open the path with the given flags/mode, then discard the handle.
    /// Serves as the existence-and-flags probe handlers run on `Open`.
    fn open(&self, path: &str, flags: i32, mode: u32) -> FsResult<()>;
    fn read_to_string(&self, path: &str) -> FsResult<String>;
    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()>;
    /// Stat following symlinks.
    fn stat(&self, path: &str) -> FsResult<NodeStat>;
    /// Stat without following symlinks.
    fn lstat(&self, path: &str) -> FsResult<NodeStat>;
    fn read_link(&self, path: &str) -> FsResult<String>;
    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>>;
    /// Inode of `/proc/<pid>/ns/<kind>`.
    fn ns_inode(&self, pid: u32, kind: NsKind) -> FsResult<u64>;

    /// First line of the file, trailing whitespace removed.
    fn read_line(&self, path: &str) -> FsResult<String> {
        let content = self.read_to_string(path)?;
        Ok(content
            .lines()
            .next()
            .unwrap_or_default()
            .trim_end()
            .to_string())
    }
}

/// A path a handler operates on, together with its open state.
#[derive(Clone)]
pub struct IoNode {
    name: String,
    path: String,
    flags: i32,
    mode: u32,
    io: Arc<dyn IoBackend>,
}

impl IoNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn open_flags(&self) -> i32 {
        self.flags
    }

    pub fn set_open_flags(&mut self, flags: i32) {
        self.flags = flags;
    }

    pub fn open_mode(&self) -> u32 {
        self.mode
    }

    pub fn set_open_mode(&mut self, mode: u32) {
        self.mode = mode;
    }

    pub fn open(&self) -> FsResult<()> {
        self.io.open(&self.path, self.flags, self.mode)
    }

    pub fn close(&self) -> FsResult<()> {
        Ok(())
    }

    pub fn read_line(&self) -> FsResult<String> {
        self.io.read_line(&self.path)
    }

    pub fn write_file(&self, data: &[u8]) -> FsResult<()> {
        self.io.write_file(&self.path, data)
    }

    pub fn stat(&self) -> FsResult<NodeStat> {
        self.io.stat(&self.path)
    }

    pub fn file_info(&self) -> FsResult<FileInfo> {
        Ok(self.stat()?.file_info(&self.name))
    }

    pub fn read_dir(&self) -> FsResult<Vec<FileInfo>> {
        self.io.read_dir(&self.path)
    }
}

/// Hands out IO-nodes bound to one backend.
#[derive(Clone)]
pub struct IoService {
    backend: Arc<dyn IoBackend>,
}

impl IoService {
    pub fn real() -> Self {
        Self {
            backend: Arc::new(RealIo),
        }
    }

    pub fn with_backend(backend: Arc<dyn IoBackend>) -> Self {
        Self { backend }
    }

    pub fn new_node(&self, name: &str, path: &str) -> IoNode {
        IoNode {
            name: name.to_string(),
            path: path.to_string(),
            flags: 0,
            mode: 0,
            io: Arc::clone(&self.backend),
        }
    }

    pub fn backend(&self) -> Arc<dyn IoBackend> {
        Arc::clone(&self.backend)
    }
}

/// Lexical parent directory ("/a/b" -> "/a", "/a" -> "/").
pub(crate) fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Join and lexically normalize: collapses repeated separators, drops `.`,
/// resolves `..` without ever climbing above `/`.
pub(crate) fn clean_join(base: &str, rest: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in base.split('/').chain(rest.split('/')) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn map_os_error(err: std::io::Error) -> FsError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => FsError::NotFound,
        Some(libc::ENOTDIR) => FsError::NotADirectory,
        Some(libc::EACCES) => FsError::AccessDenied,
        Some(libc::EPERM) => FsError::NotPermitted,
        _ => FsError::HostIo(err),
    }
}

/// Host filesystem backend.
pub struct RealIo;

impl RealIo {
    fn node_stat(meta: &std::fs::Metadata) -> NodeStat {
        use std::os::unix::fs::MetadataExt;
        NodeStat {
            ino: meta.ino(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size() as i64,
            mtime: meta.mtime(),
        }
    }
}

impl IoBackend for RealIo {
    fn open(&self, path: &str, flags: i32, mode: u32) -> FsResult<()> {
        use std::os::unix::fs::OpenOptionsExt;
        let acc = flags & libc::O_ACCMODE;
        let mut opts = std::fs::OpenOptions::new();
        opts.read(acc == libc::O_RDONLY || acc == libc::O_RDWR)
            .write(acc == libc::O_WRONLY || acc == libc::O_RDWR)
            .create(flags & libc::O_CREAT != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC))
            .mode(mode);
        opts.open(path).map(|_| ()).map_err(map_os_error)
    }

    fn read_to_string(&self, path: &str) -> FsResult<String> {
        std::fs::read_to_string(path).map_err(map_os_error)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        std::fs::write(path, data).map_err(map_os_error)
    }

    fn stat(&self, path: &str) -> FsResult<NodeStat> {
        std::fs::metadata(path)
            .map(|m| Self::node_stat(&m))
            .map_err(map_os_error)
    }

    fn lstat(&self, path: &str) -> FsResult<NodeStat> {
        std::fs::symlink_metadata(path)
            .map(|m| Self::node_stat(&m))
            .map_err(map_os_error)
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        std::fs::read_link(path)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(map_os_error)
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path).map_err(map_os_error)? {
            let entry = entry.map_err(map_os_error)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata() {
                Ok(m) => m,
                // Entries may vanish between readdir and stat; skip them.
                Err(_) => continue,
            };
            entries.push(Self::node_stat(&meta).file_info(&name));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn ns_inode(&self, pid: u32, kind: NsKind) -> FsResult<u64> {
        Ok(self.stat(&format!("/proc/{}/ns/{}", pid, kind))?.ino)
    }
}

#[derive(Clone, Debug)]
enum MemKind {
    File(String),
    Dir,
    Symlink(String),
}

#[derive(Clone, Debug)]
struct MemEntry {
    kind: MemKind,
    ino: u64,
    uid: u32,
    gid: u32,
    perm: u32,
}

impl MemEntry {
    fn node_stat(&self) -> NodeStat {
        let (type_bits, size) = match &self.kind {
            MemKind::File(content) => (libc::S_IFREG, content.len() as i64),
            MemKind::Dir => (libc::S_IFDIR, 0),
            MemKind::Symlink(target) => (libc::S_IFLNK, target.len() as i64),
        };
        NodeStat {
            ino: self.ino,
            mode: type_bits | self.perm,
            uid: self.uid,
            gid: self.gid,
            size,
            mtime: 0,
        }
    }
}

/// In-memory filesystem for tests. Parent directories are created
/// implicitly; ownership and permissions default to root / 0o644 (0o755 for
/// directories) and can be adjusted with [`MemIo::chown`] / [`MemIo::chmod`].
pub struct MemIo {
    entries: Mutex<HashMap<String, MemEntry>>,
    next_ino: AtomicU64,
}

impl Default for MemIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemIo {
    pub fn new() -> Self {
        let io = Self {
            entries: Mutex::new(HashMap::new()),
            next_ino: AtomicU64::new(2),
        };
        io.entries.lock().unwrap().insert(
            "/".to_string(),
            MemEntry {
                kind: MemKind::Dir,
                ino: 1,
                uid: 0,
                gid: 0,
                perm: 0o755,
            },
        );
        io
    }

    fn insert(&self, path: &str, kind: MemKind, perm: u32) {
        let path = clean_join("/", path);
        self.ensure_parents(&path);
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(
            path,
            MemEntry {
                kind,
                ino,
                uid: 0,
                gid: 0,
                perm,
            },
        );
    }

    fn ensure_parents(&self, path: &str) {
        let mut dir = parent_dir(path);
        let mut missing = Vec::new();
        {
            let entries = self.entries.lock().unwrap();
            while !entries.contains_key(&dir) {
                missing.push(dir.clone());
                dir = parent_dir(&dir);
            }
        }
        for dir in missing.into_iter().rev() {
            let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
            self.entries.lock().unwrap().insert(
                dir,
                MemEntry {
                    kind: MemKind::Dir,
                    ino,
                    uid: 0,
                    gid: 0,
                    perm: 0o755,
                },
            );
        }
    }

    pub fn add_file(&self, path: &str, content: &str) {
        self.insert(path, MemKind::File(content.to_string()), 0o644);
    }

    pub fn add_dir(&self, path: &str) {
        self.insert(path, MemKind::Dir, 0o755);
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.insert(path, MemKind::Symlink(target.to_string()), 0o777);
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(path) {
            entry.uid = uid;
            entry.gid = gid;
        }
    }

    pub fn chmod(&self, path: &str, perm: u32) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(path) {
            entry.perm = perm;
        }
    }

    /// Register `/proc/<pid>/ns/<kind>` carrying the given inode number.
    pub fn add_ns_inode(&self, pid: u32, kind: NsKind, inode: u64) {
        self.add_file(&format!("/proc/{}/ns/{}", pid, kind), &inode.to_string());
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        match &self.entries.lock().unwrap().get(path)?.kind {
            MemKind::File(content) => Some(content.clone()),
            _ => None,
        }
    }

    fn get(&self, path: &str) -> FsResult<MemEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    /// Follow leaf symlinks, bounded like the kernel's resolver.
    fn resolve(&self, path: &str) -> FsResult<(String, MemEntry)> {
        let mut cur = clean_join("/", path);
        for _ in 0..40 {
            let entry = self.get(&cur)?;
            match &entry.kind {
                MemKind::Symlink(target) => {
                    cur = if target.starts_with('/') {
                        clean_join("/", target)
                    } else {
                        clean_join(&parent_dir(&cur), target)
                    };
                }
                _ => return Ok((cur, entry)),
            }
        }
        Err(FsError::LinkLoop)
    }
}

impl IoBackend for MemIo {
    fn open(&self, path: &str, flags: i32, _mode: u32) -> FsResult<()> {
        match self.resolve(path) {
            Ok(_) => Ok(()),
            Err(FsError::NotFound) if flags & libc::O_CREAT != 0 => {
                self.add_file(path, "");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn read_to_string(&self, path: &str) -> FsResult<String> {
        match self.resolve(path)?.1.kind {
            MemKind::File(content) => Ok(content),
            _ => Err(FsError::InvalidArgument("not a regular file".into())),
        }
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let content = String::from_utf8_lossy(data).into_owned();
        match self.resolve(path) {
            Ok((real_path, _)) => {
                if let Some(entry) = self.entries.lock().unwrap().get_mut(&real_path) {
                    entry.kind = MemKind::File(content);
                }
                Ok(())
            }
            Err(FsError::NotFound) => {
                self.insert(path, MemKind::File(content), 0o644);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn stat(&self, path: &str) -> FsResult<NodeStat> {
        Ok(self.resolve(path)?.1.node_stat())
    }

    fn lstat(&self, path: &str) -> FsResult<NodeStat> {
        Ok(self.get(&clean_join("/", path))?.node_stat())
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        match self.get(&clean_join("/", path))?.kind {
            MemKind::Symlink(target) => Ok(target),
            _ => Err(FsError::InvalidArgument("not a symlink".into())),
        }
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let (dir, entry) = self.resolve(path)?;
        if !matches!(entry.kind, MemKind::Dir) {
            return Err(FsError::NotADirectory);
        }
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<FileInfo> = entries
            .iter()
            .filter(|(p, _)| {
                p.starts_with(&prefix) && *p != &dir && !p[prefix.len()..].contains('/')
            })
            .map(|(p, e)| e.node_stat().file_info(&p[prefix.len()..]))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn ns_inode(&self, pid: u32, kind: NsKind) -> FsResult<u64> {
        let content = self.read_to_string(&format!("/proc/{}/ns/{}", pid, kind))?;
        content
            .trim()
            .parse()
            .map_err(|_| FsError::InvalidArgument("malformed namespace inode".into()))
    }
}
