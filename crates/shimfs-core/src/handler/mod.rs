// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handler framework and registry
//!
//! Every emulated resource is owned by a handler registered under a path
//! prefix. Dispatch resolves the longest registered prefix of the request
//! path and routes the operation to that handler. The registry is populated
//! once at service construction and read-only afterwards.

pub mod binfmt;
pub mod common;
pub mod hostdir;
pub mod max_int;
pub mod uptime;
pub mod userns_hidden;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use shimfs_proto::{FileInfo, NsKind, StatData};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::ionode::{IoBackend, IoNode, IoService};
use crate::nsenter::NsenterService;
use crate::process::ProcessService;
use crate::state::{Container, ContainerRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    /// Plain host directory, no container interaction.
    Directory,
    /// Forwarded into the container's namespaces.
    Passthrough,
    /// Host-global sysctl reconciled to the max across containers.
    MaxIntSysctl,
    /// Kernel-namespaced resource hidden from non-initial user namespaces.
    UsernsHidden,
    /// Value synthesized from per-container state.
    Synthetic,
}

/// Per-operation context handed to a handler. Built from the FUSE request
/// header, destroyed when the operation completes; handlers must not retain
/// it.
pub struct HandlerRequest {
    pub id: u64,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub offset: u64,
    pub data: Vec<u8>,
    pub container: Option<Arc<Container>>,
}

impl HandlerRequest {
    pub fn new(pid: u32, uid: u32, gid: u32) -> Self {
        Self {
            id: 0,
            pid,
            uid,
            gid,
            offset: 0,
            data: Vec::new(),
            container: None,
        }
    }

    /// The originating sys container, or the error every handler reports
    /// for container-less requests.
    pub fn require_container(&self) -> FsResult<Arc<Container>> {
        self.container.clone().ok_or(FsError::ContainerNotFound)
    }
}

/// Operation set every handler implements.
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;
    fn path(&self) -> &str;
    fn kind(&self) -> HandlerKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn service(&self) -> FsResult<Arc<HandlerService>>;
    fn set_service(&self, service: Weak<HandlerService>);

    fn lookup(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<FileInfo>;
    /// Synthesized ownership for the node, or `None` to let the adaptor
    /// fall back to host attributes.
    fn getattr(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Option<StatData>>;
    fn setattr(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<()>;
    fn open(&self, node: &mut IoNode, req: &HandlerRequest) -> FsResult<()>;
    fn close(&self, node: &IoNode) -> FsResult<()>;
    /// Fill `req.data` and return the byte count produced.
    fn read(&self, node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize>;
    /// Consume `req.data` and return the byte count accepted.
    fn write(&self, node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize>;
    fn read_dir_all(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Vec<FileInfo>>;
}

/// Fields shared by every handler implementation.
pub struct HandlerBase {
    pub name: String,
    pub path: String,
    pub kind: HandlerKind,
    pub enabled: AtomicBool,
    pub cacheable: bool,
    /// Serializes host-side reconciliation for this resource.
    pub lock: Mutex<()>,
    service: RwLock<Weak<HandlerService>>,
}

impl HandlerBase {
    pub fn new(name: &str, path: &str, kind: HandlerKind, cacheable: bool) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            cacheable,
            lock: Mutex::new(()),
            service: RwLock::new(Weak::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn attach(&self, service: Weak<HandlerService>) {
        *self.service.write().unwrap() = service;
    }

    pub fn service(&self) -> FsResult<Arc<HandlerService>> {
        self.service
            .read()
            .unwrap()
            .upgrade()
            .ok_or(FsError::ServiceDetached)
    }
}

/// Copy a produced payload into the request's result buffer, truncating to
/// the buffer's capacity.
pub fn copy_result_buffer(req: &mut HandlerRequest, src: &[u8]) -> FsResult<usize> {
    let n = src.len().min(req.data.len());
    req.data[..n].copy_from_slice(&src[..n]);
    Ok(n)
}

/// Owns the handler registry and the services handlers reach through.
pub struct HandlerService {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    io: IoService,
    state: Arc<ContainerRegistry>,
    process: Arc<ProcessService>,
    nsenter: Arc<dyn NsenterService>,
    host_user_ns_inode: u64,
    ignore_push_errors: bool,
}

impl HandlerService {
    pub fn new(
        io: IoService,
        state: Arc<ContainerRegistry>,
        process: Arc<ProcessService>,
        nsenter: Arc<dyn NsenterService>,
        ignore_push_errors: bool,
    ) -> Arc<Self> {
        let host_user_ns_inode = io
            .backend()
            .ns_inode(std::process::id(), NsKind::User)
            .unwrap_or(0);
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            io,
            state,
            process,
            nsenter,
            host_user_ns_inode,
            ignore_push_errors,
        })
    }

    /// Install the full emulation table.
    pub fn register_defaults(self: &Arc<Self>) {
        self.register(Arc::new(hostdir::HostDirHandler::new("rootDir", "/")));
        self.register(Arc::new(hostdir::HostDirHandler::new("procDir", "/proc")));
        self.register(Arc::new(hostdir::HostDirHandler::new("sysDir", "/sys")));
        self.register(Arc::new(common::CommonHandler::new()));
        self.register(Arc::new(uptime::UptimeHandler::new()));
        self.register(Arc::new(binfmt::BinfmtStatusHandler::new()));
        self.register(Arc::new(max_int::MaxIntHandler::new(
            "nfConntrackMax",
            "/proc/sys/net/netfilter/nf_conntrack_max",
        )));
        self.register(Arc::new(max_int::MaxIntHandler::new(
            "fileMax",
            "/proc/sys/fs/file-max",
        )));
        self.register(Arc::new(userns_hidden::UsernsHiddenHandler::new(
            "vsExpireNoDestConn",
            "/proc/sys/net/ipv4/vs/expire_nodest_conn",
        )));
        self.register(Arc::new(userns_hidden::UsernsHiddenHandler::new(
            "vsExpireQuiescentTemplate",
            "/proc/sys/net/ipv4/vs/expire_quiescent_template",
        )));
    }

    pub fn register(self: &Arc<Self>, handler: Arc<dyn Handler>) {
        handler.set_service(Arc::downgrade(self));
        self.handlers
            .write()
            .unwrap()
            .insert(handler.path().to_string(), handler);
    }

    /// Longest-prefix match over the registered paths.
    pub fn lookup_handler(&self, path: &str) -> FsResult<Arc<dyn Handler>> {
        let handlers = self.handlers.read().unwrap();
        let mut candidate = path.to_string();
        loop {
            if let Some(handler) = handlers.get(&candidate) {
                debug!(
                    target: "shimfs::handler",
                    path,
                    handler = handler.name(),
                    "handler resolved"
                );
                return Ok(Arc::clone(handler));
            }
            if candidate == "/" {
                return Err(FsError::HandlerNotFound(path.to_string()));
            }
            candidate = crate::ionode::parent_dir(&candidate);
        }
    }

    pub fn find_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap()
            .values()
            .find(|h| h.name() == name)
            .cloned()
    }

    /// Emulated children directly below `dir`, keyed by entry name. An
    /// intermediate path component of a deeper handler shows up as a
    /// synthetic directory.
    pub fn emulated_entries(
        &self,
        dir: &str,
        req: &HandlerRequest,
    ) -> HashMap<String, FileInfo> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{}/", dir)
        };

        let handlers: Vec<Arc<dyn Handler>> =
            self.handlers.read().unwrap().values().cloned().collect();

        let mut entries = HashMap::new();
        for handler in handlers {
            if !handler.enabled() {
                continue;
            }
            let hpath = handler.path();
            if hpath == dir || !hpath.starts_with(&prefix) {
                continue;
            }
            let rest = &hpath[prefix.len()..];
            let name = match rest.split('/').next() {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => continue,
            };
            if entries.contains_key(&name) {
                continue;
            }

            let info = if rest.contains('/') {
                FileInfo {
                    name: name.clone(),
                    mode: libc::S_IFDIR | 0o555,
                    is_dir: true,
                    ..Default::default()
                }
            } else {
                let node = self.io.new_node(&name, &format!("{}{}", prefix, name));
                handler.lookup(&node, req).unwrap_or_else(|_| {
                    // Subtree owners are directories; leaf resources are
                    // files.
                    let is_dir = matches!(
                        handler.kind(),
                        HandlerKind::Directory | HandlerKind::Passthrough
                    );
                    let mode = if is_dir {
                        libc::S_IFDIR | 0o555
                    } else {
                        libc::S_IFREG | 0o644
                    };
                    FileInfo {
                        name: name.clone(),
                        mode,
                        is_dir,
                        ..Default::default()
                    }
                })
            };
            entries.insert(name, info);
        }
        entries
    }

    /// Merge a host/helper directory listing with the emulated children of
    /// `dir`. Emulated names win on collision.
    pub fn merge_emulated(
        &self,
        dir: &str,
        req: &HandlerRequest,
        host_entries: Vec<FileInfo>,
    ) -> Vec<FileInfo> {
        let emulated = self.emulated_entries(dir, req);
        let mut out: Vec<FileInfo> = emulated.values().cloned().collect();
        for info in host_entries {
            if !emulated.contains_key(&info.name) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Resolve the container a FUSE request originates from.
    pub fn container_for_request(&self, pid: u32, uid: u32, gid: u32) -> Option<Arc<Container>> {
        let process = self.process.create(pid, uid, gid);
        self.state.lookup_by_process(&process)
    }

    /// User-namespace inode of an arbitrary pid, zero when unknown.
    pub fn find_user_ns_inode(&self, pid: u32) -> u64 {
        self.process.create(pid, 0, 0).user_ns_inode()
    }

    pub fn host_user_ns_inode(&self) -> u64 {
        self.host_user_ns_inode
    }

    pub fn ignore_push_errors(&self) -> bool {
        self.ignore_push_errors
    }

    pub fn io(&self) -> &IoService {
        &self.io
    }

    pub fn io_backend(&self) -> Arc<dyn IoBackend> {
        self.io.backend()
    }

    pub fn state(&self) -> &Arc<ContainerRegistry> {
        &self.state
    }

    pub fn process(&self) -> &Arc<ProcessService> {
        &self.process
    }

    pub fn nsenter(&self) -> &Arc<dyn NsenterService> {
        &self.nsenter
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::ionode::MemIo;
    use crate::nsenter::MockNsenterService;
    use crate::state::ContainerSpec;

    /// A service wired to an in-memory filesystem and a mock helper
    /// pipeline, for handler tests.
    pub(crate) fn service_with_mock(
        io: Arc<MemIo>,
        nsenter: MockNsenterService,
    ) -> Arc<HandlerService> {
        let backend = Arc::clone(&io) as Arc<dyn IoBackend>;
        let process = Arc::new(ProcessService::new(Arc::clone(&backend)));
        let state = Arc::new(ContainerRegistry::new(
            Arc::clone(&backend),
            Arc::clone(&process),
        ));
        let service = HandlerService::new(
            IoService::with_backend(backend),
            state,
            process,
            Arc::new(nsenter),
            false,
        );
        service.register_defaults();
        service
    }

    /// Seed the namespace files of a pid so that process descriptors and
    /// registration work against `MemIo`.
    pub(crate) fn seed_ns(io: &MemIo, pid: u32, user_inode: u64) {
        for kind in NsKind::ALL {
            let inode = if kind == NsKind::User {
                user_inode
            } else {
                user_inode + kind as u64 + 1
            };
            io.add_ns_inode(pid, kind, inode);
        }
    }

    /// Register a container whose init pid is `init_pid`.
    pub(crate) fn register_container(
        service: &Arc<HandlerService>,
        io: &MemIo,
        id: &str,
        init_pid: u32,
        user_inode: u64,
    ) -> Arc<Container> {
        seed_ns(io, init_pid, user_inode);
        service
            .state()
            .register(ContainerSpec {
                id: id.to_string(),
                init_pid,
                hostname: id.to_string(),
                uid_first: 231072,
                uid_size: 65536,
                gid_first: 231072,
                gid_size: 65536,
            })
            .expect("container registration")
    }

    #[test]
    fn registry_resolves_longest_prefix() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());

        let h = service
            .lookup_handler("/proc/sys/net/ipv4/ip_forward")
            .unwrap();
        assert_eq!(h.path(), "/proc/sys");

        let h = service
            .lookup_handler("/proc/sys/net/netfilter/nf_conntrack_max")
            .unwrap();
        assert_eq!(h.name(), "nfConntrackMax");

        let h = service.lookup_handler("/proc/uptime").unwrap();
        assert_eq!(h.name(), "procUptime");

        // Anything else lands on the root handler.
        let h = service.lookup_handler("/sys/kernel/mm").unwrap();
        assert_eq!(h.path(), "/sys");
        let h = service.lookup_handler("/testing").unwrap();
        assert_eq!(h.path(), "/");
    }

    #[test]
    fn emulated_entries_surface_intermediate_directories() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let req = HandlerRequest::new(1, 0, 0);

        let entries = service.emulated_entries("/proc/sys/net/ipv4", &req);
        let vs = entries.get("vs").expect("vs directory");
        assert!(vs.is_dir);

        // The registered sysctls appear once we descend into it.
        let entries = service.emulated_entries("/proc/sys/net/ipv4/vs", &req);
        assert!(entries.contains_key("expire_nodest_conn"));
        assert!(entries.contains_key("expire_quiescent_template"));
    }

    #[test]
    fn merge_prefers_emulated_entries() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let req = HandlerRequest::new(1, 0, 0);

        let host = vec![
            FileInfo {
                name: "vs".to_string(),
                mode: libc::S_IFDIR | 0o755,
                is_dir: false, // deliberately wrong: the merged view must use ours
                ..Default::default()
            },
            FileInfo {
                name: "tcp_rmem".to_string(),
                mode: libc::S_IFREG | 0o644,
                ..Default::default()
            },
        ];

        let merged = service.merge_emulated("/proc/sys/net/ipv4", &req, host);
        let vs = merged.iter().find(|e| e.name == "vs").unwrap();
        assert!(vs.is_dir);
        assert!(merged.iter().any(|e| e.name == "tcp_rmem"));
    }
}
