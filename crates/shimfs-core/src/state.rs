// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Container state registry
//!
//! Two tables behind one read/write lock: container id -> record, and
//! user-namespace inode -> container id. A container is registered iff it is
//! present in both. Handlers only ever read the registry; registration
//! events from the runtime are the only writers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use shimfs_proto::NsKind;
use tracing::{debug, info};

use crate::error::{FsError, FsResult};
use crate::ionode::IoBackend;
use crate::process::{Process, ProcessService};

/// Identity delivered by a container registration or update event.
#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub id: String,
    pub init_pid: u32,
    pub hostname: String,
    pub uid_first: u32,
    pub uid_size: u32,
    pub gid_first: u32,
    pub gid_size: u32,
}

#[derive(Debug, Default)]
struct ContainerState {
    init_pid: u32,
    ctime: Option<SystemTime>,
    hostname: String,
    uid_first: u32,
    uid_size: u32,
    gid_first: u32,
    gid_size: u32,
    user_ns_inode: u64,
    pid_ns_inode: u64,
}

type DataStore = HashMap<String, HashMap<String, String>>;

/// All the state shimfs keeps for one sys container.
pub struct Container {
    id: String,
    state: RwLock<ContainerState>,
    init_proc: Arc<Process>,
    data: Mutex<DataStore>,
}

impl Container {
    fn new(spec: &ContainerSpec, user_ns_inode: u64, pid_ns_inode: u64, init_proc: Arc<Process>) -> Self {
        Self {
            id: spec.id.clone(),
            state: RwLock::new(ContainerState {
                init_pid: spec.init_pid,
                ctime: Some(SystemTime::now()),
                hostname: spec.hostname.clone(),
                uid_first: spec.uid_first,
                uid_size: spec.uid_size,
                gid_first: spec.gid_first,
                gid_size: spec.gid_size,
                user_ns_inode,
                pid_ns_inode,
            }),
            init_proc,
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn init_pid(&self) -> u32 {
        self.state.read().unwrap().init_pid
    }

    pub fn ctime(&self) -> Option<SystemTime> {
        self.state.read().unwrap().ctime
    }

    pub fn set_ctime(&self, t: SystemTime) {
        self.state.write().unwrap().ctime = Some(t);
    }

    pub fn hostname(&self) -> String {
        self.state.read().unwrap().hostname.clone()
    }

    /// First host-side uid of the container's id mapping; the owner shown
    /// for synthesized attributes.
    pub fn uid(&self) -> u32 {
        self.state.read().unwrap().uid_first
    }

    pub fn gid(&self) -> u32 {
        self.state.read().unwrap().gid_first
    }

    pub fn uid_size(&self) -> u32 {
        self.state.read().unwrap().uid_size
    }

    pub fn gid_size(&self) -> u32 {
        self.state.read().unwrap().gid_size
    }

    pub fn user_ns_inode(&self) -> u64 {
        self.state.read().unwrap().user_ns_inode
    }

    pub fn pid_ns_inode(&self) -> u64 {
        self.state.read().unwrap().pid_ns_inode
    }

    pub fn init_proc(&self) -> Arc<Process> {
        Arc::clone(&self.init_proc)
    }

    /// Cached payload for `(path, name)`, if any.
    pub fn data(&self, path: &str, name: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap()
            .get(path)
            .and_then(|names| names.get(name))
            .cloned()
    }

    pub fn set_data(&self, path: &str, name: &str, value: String) {
        self.data
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Run a compound read-modify-write against the data store under one
    /// lock acquisition. The closure must not perform cross-namespace
    /// requests.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut DataStore) -> R) -> R {
        f(&mut self.data.lock().unwrap())
    }

    fn update(&self, spec: &ContainerSpec) {
        let mut state = self.state.write().unwrap();
        state.init_pid = spec.init_pid;
        state.hostname = spec.hostname.clone();
        state.uid_first = spec.uid_first;
        state.uid_size = spec.uid_size;
        state.gid_first = spec.gid_first;
        state.gid_size = spec.gid_size;
    }
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, Arc<Container>>,
    by_user_ns: HashMap<u64, String>,
}

pub struct ContainerRegistry {
    io: Arc<dyn IoBackend>,
    process: Arc<ProcessService>,
    tables: RwLock<Tables>,
}

impl ContainerRegistry {
    pub fn new(io: Arc<dyn IoBackend>, process: Arc<ProcessService>) -> Self {
        Self {
            io,
            process,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Register a container. Captures the init process's user and pid
    /// namespace inodes, stamps the creation time, and publishes the record
    /// under both keys atomically.
    pub fn register(&self, spec: ContainerSpec) -> FsResult<Arc<Container>> {
        let user_ns_inode = self.io.ns_inode(spec.init_pid, NsKind::User)?;
        let pid_ns_inode = self.io.ns_inode(spec.init_pid, NsKind::Pid)?;

        let init_proc = Arc::new(self.process.create(spec.init_pid, 0, 0));
        let container = Arc::new(Container::new(&spec, user_ns_inode, pid_ns_inode, init_proc));

        let mut tables = self.tables.write().unwrap();
        if tables.by_id.contains_key(&spec.id) || tables.by_user_ns.contains_key(&user_ns_inode) {
            return Err(FsError::AlreadyRegistered);
        }
        tables.by_id.insert(spec.id.clone(), Arc::clone(&container));
        tables.by_user_ns.insert(user_ns_inode, spec.id.clone());

        info!(
            target: "shimfs::state",
            id = %spec.id,
            init_pid = spec.init_pid,
            user_ns_inode,
            "container registered"
        );
        Ok(container)
    }

    /// Patch the identity of an already-registered container in place.
    pub fn update(&self, spec: ContainerSpec) -> FsResult<()> {
        let tables = self.tables.read().unwrap();
        let container = tables.by_id.get(&spec.id).ok_or(FsError::NotRegistered)?;
        container.update(&spec);
        debug!(target: "shimfs::state", id = %spec.id, "container updated");
        Ok(())
    }

    /// Remove a container from both tables. Fails unless the inode table
    /// still points back at this record.
    pub fn unregister(&self, id: &str) -> FsResult<()> {
        let mut tables = self.tables.write().unwrap();
        let container = tables.by_id.get(id).ok_or(FsError::NotRegistered)?;
        let inode = container.user_ns_inode();
        match tables.by_user_ns.get(&inode) {
            Some(mapped) if mapped == id => {}
            _ => return Err(FsError::NotRegistered),
        }
        tables.by_user_ns.remove(&inode);
        tables.by_id.remove(id);

        info!(target: "shimfs::state", id, "container unregistered");
        Ok(())
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Container>> {
        self.tables.read().unwrap().by_id.get(id).cloned()
    }

    pub fn lookup_by_user_ns(&self, inode: u64) -> Option<Arc<Container>> {
        let tables = self.tables.read().unwrap();
        let id = tables.by_user_ns.get(&inode)?;
        tables.by_id.get(id).cloned()
    }

    /// Resolve the container a process belongs to: its user-namespace inode
    /// first, then — on Linux — each ancestor namespace via
    /// `ioctl(NS_GET_PARENT)` until a registered inode is found or the root
    /// user namespace is reached.
    pub fn lookup_by_process(&self, process: &Process) -> Option<Arc<Container>> {
        let inode = process.user_ns_inode();
        if inode == 0 {
            return None;
        }
        if let Some(container) = self.lookup_by_user_ns(inode) {
            return Some(container);
        }
        self.lookup_by_ns_ancestors(process.pid())
    }

    #[cfg(target_os = "linux")]
    fn lookup_by_ns_ancestors(&self, pid: u32) -> Option<Arc<Container>> {
        use std::os::fd::{AsRawFd, FromRawFd};
        use std::os::unix::fs::MetadataExt;

        nix::ioctl_none!(ns_get_parent, 0xb7, 0x2);

        let mut file = std::fs::File::open(format!("/proc/{}/ns/user", pid)).ok()?;
        loop {
            // EPERM here means the parent lives outside our scope, i.e. we
            // reached the root user namespace.
            let parent_fd = unsafe { ns_get_parent(file.as_raw_fd()).ok()? };
            let parent = unsafe { std::fs::File::from_raw_fd(parent_fd) };
            let inode = parent.metadata().ok()?.ino();
            if let Some(container) = self.lookup_by_user_ns(inode) {
                return Some(container);
            }
            file = parent;
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn lookup_by_ns_ancestors(&self, _pid: u32) -> Option<Arc<Container>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ionode::MemIo;

    fn registry() -> (Arc<MemIo>, ContainerRegistry) {
        let io = Arc::new(MemIo::new());
        let backend = Arc::clone(&io) as Arc<dyn IoBackend>;
        let process = Arc::new(ProcessService::new(Arc::clone(&backend)));
        (io, ContainerRegistry::new(backend, process))
    }

    fn spec(id: &str, init_pid: u32) -> ContainerSpec {
        ContainerSpec {
            id: id.to_string(),
            init_pid,
            hostname: format!("host-{}", id),
            uid_first: 231072,
            uid_size: 65536,
            gid_first: 231072,
            gid_size: 65536,
        }
    }

    fn seed_ns(io: &MemIo, pid: u32, user_inode: u64) {
        for kind in NsKind::ALL {
            let inode = if kind == NsKind::User {
                user_inode
            } else {
                user_inode + kind as u64 + 1
            };
            io.add_ns_inode(pid, kind, inode);
        }
    }

    #[test]
    fn register_links_both_tables() {
        let (io, registry) = registry();
        seed_ns(&io, 1001, 4026540000);

        let container = registry.register(spec("c1", 1001)).unwrap();
        assert_eq!(container.user_ns_inode(), 4026540000);
        assert!(container.ctime().is_some());

        let by_inode = registry.lookup_by_user_ns(4026540000).unwrap();
        assert_eq!(by_inode.id(), "c1");
        assert_eq!(registry.lookup_by_id("c1").unwrap().init_pid(), 1001);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (io, registry) = registry();
        seed_ns(&io, 1001, 4026540000);
        seed_ns(&io, 2002, 4026540000); // same user namespace

        registry.register(spec("c1", 1001)).unwrap();
        assert!(matches!(
            registry.register(spec("c1", 3003)),
            Err(FsError::AlreadyRegistered)
        ));
        assert!(matches!(
            registry.register(spec("c2", 2002)),
            Err(FsError::AlreadyRegistered)
        ));
    }

    #[test]
    fn registration_needs_the_init_namespace_files() {
        let (_io, registry) = registry();
        assert!(registry.register(spec("c1", 9999)).is_err());
    }

    #[test]
    fn unregister_requires_consistent_tables() {
        let (io, registry) = registry();
        seed_ns(&io, 1001, 4026540000);

        registry.register(spec("c1", 1001)).unwrap();
        assert!(matches!(
            registry.unregister("nope"),
            Err(FsError::NotRegistered)
        ));
        registry.unregister("c1").unwrap();
        assert!(registry.lookup_by_id("c1").is_none());
        assert!(registry.lookup_by_user_ns(4026540000).is_none());
        assert!(matches!(
            registry.unregister("c1"),
            Err(FsError::NotRegistered)
        ));
    }

    #[test]
    fn update_patches_identity_in_place() {
        let (io, registry) = registry();
        seed_ns(&io, 1001, 4026540000);
        registry.register(spec("c1", 1001)).unwrap();

        let mut new_spec = spec("c1", 1111);
        new_spec.hostname = "renamed".to_string();
        registry.update(new_spec).unwrap();

        let container = registry.lookup_by_id("c1").unwrap();
        assert_eq!(container.init_pid(), 1111);
        assert_eq!(container.hostname(), "renamed");

        assert!(matches!(
            registry.update(spec("ghost", 1)),
            Err(FsError::NotRegistered)
        ));
    }

    #[test]
    fn lookup_by_process_matches_user_ns() {
        let (io, registry) = registry();
        seed_ns(&io, 1001, 4026540000);
        registry.register(spec("c1", 1001)).unwrap();

        // A process inside the container shares the init's user namespace.
        seed_ns(&io, 4242, 4026540000);
        let backend = Arc::clone(&io) as Arc<dyn IoBackend>;
        let prs = ProcessService::new(backend);
        let inner = prs.create(4242, 0, 0);
        assert_eq!(registry.lookup_by_process(&inner).unwrap().id(), "c1");
    }

    #[test]
    fn container_data_store_roundtrip() {
        let (io, registry) = registry();
        seed_ns(&io, 1001, 4026540000);
        let container = registry.register(spec("c1", 1001)).unwrap();

        assert!(container.data("/proc/uptime", "uptime").is_none());
        container.set_data("/proc/uptime", "uptime", "100".to_string());
        assert_eq!(
            container.data("/proc/uptime", "uptime").as_deref(),
            Some("100")
        );

        // Multi-line payloads survive unchanged.
        container.set_data("/proc/cpuinfo", "cpuinfo", "foo \n bar".to_string());
        assert_eq!(
            container.data("/proc/cpuinfo", "cpuinfo").as_deref(),
            Some("foo \n bar")
        );

        // Updates replace in place.
        container.set_data("/proc/uptime", "uptime", "200".to_string());
        assert_eq!(
            container.data("/proc/uptime", "uptime").as_deref(),
            Some("200")
        );
    }
}
