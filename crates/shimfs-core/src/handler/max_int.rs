// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Base handler for max-valued kernel sysctls
//!
//! Serves sysctls that hold a single integer and whose host value must stay
//! the maximum across all sys containers on the machine. Each container
//! sees the value it wrote; the host only ever moves up.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use shimfs_proto::{FileInfo, StatData};
use tracing::{debug, error};

use crate::error::{FsError, FsResult};
use crate::handler::{
    copy_result_buffer, Handler, HandlerBase, HandlerKind, HandlerRequest, HandlerService,
};
use crate::ionode::IoNode;
use crate::process::{R_OK, W_OK};

const PUSH_RETRIES: usize = 5;
const PUSH_RETRY_DELAY_US: u64 = 100;

pub struct MaxIntHandler {
    base: HandlerBase,
}

impl MaxIntHandler {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            base: HandlerBase::new(name, path, HandlerKind::MaxIntSysctl, true),
        }
    }

    /// Read the current host value. Holds the per-resource lock for the
    /// read itself; the value must parse as an integer.
    fn fetch_file(&self, node: &IoNode) -> FsResult<String> {
        let current = {
            let _guard = self.base.lock.lock().unwrap();
            node.read_line().map_err(|err| {
                error!(
                    target: "shimfs::handler",
                    path = node.path(),
                    %err,
                    "could not read host value"
                );
                FsError::host("sysctl read failed")
            })?
        };

        if current.parse::<i64>().is_err() {
            return Err(FsError::InvalidArgument(format!(
                "unexpected content in {}: {:?}",
                node.path(),
                current
            )));
        }
        Ok(current)
    }

    /// Push a new value to the host kernel.
    ///
    /// The per-resource lock serializes containers served by this instance,
    /// but other agents on the host may write the same sysctl concurrently.
    /// The loop re-reads before each write and backs off a random delay
    /// between attempts so a competing smaller write is likely corrected.
    /// There is deliberately no read-verify after the final write; the
    /// property is asymptotic.
    fn push_file(&self, node: &IoNode, new_max: i64) -> FsResult<()> {
        let service = self.base.service()?;
        let _guard = self.base.lock.lock().unwrap();

        for attempt in 0..PUSH_RETRIES {
            let current = node
                .read_line()
                .map_err(|_| FsError::host("sysctl read failed"))?;
            let current: i64 = current.parse().map_err(|_| {
                FsError::InvalidArgument(format!(
                    "unexpected content in {}: {:?}",
                    node.path(),
                    current
                ))
            })?;

            // Someone raised it at least this far already; the host keeps
            // the larger value.
            if new_max <= current {
                return Ok(());
            }

            if attempt > 0 {
                let delay = rand::rng().random_range(0..PUSH_RETRY_DELAY_US);
                std::thread::sleep(Duration::from_micros(delay));
            }

            if let Err(err) = node.write_file(new_max.to_string().as_bytes()) {
                if !service.ignore_push_errors() {
                    error!(
                        target: "shimfs::handler",
                        path = node.path(),
                        %err,
                        "could not write host value"
                    );
                    return Err(FsError::host("sysctl write failed"));
                }
            }
        }

        Ok(())
    }
}

impl Handler for MaxIntHandler {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn path(&self) -> &str {
        &self.base.path
    }

    fn kind(&self) -> HandlerKind {
        self.base.kind
    }

    fn enabled(&self) -> bool {
        self.base.enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.base.set_enabled(enabled);
    }

    fn service(&self) -> FsResult<Arc<HandlerService>> {
        self.base.service()
    }

    fn set_service(&self, service: Weak<HandlerService>) {
        self.base.attach(service);
    }

    fn lookup(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<FileInfo> {
        debug!(target: "shimfs::handler", id = req.id, handler = %self.base.name, "lookup");
        node.file_info()
    }

    fn getattr(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<Option<StatData>> {
        Ok(None)
    }

    fn setattr(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<()> {
        Ok(())
    }

    fn open(&self, node: &mut IoNode, req: &HandlerRequest) -> FsResult<()> {
        debug!(target: "shimfs::handler", id = req.id, handler = %self.base.name, "open");

        let flags = node.open_flags();
        if flags != libc::O_RDONLY && flags != libc::O_WRONLY {
            return Err(FsError::AccessDenied);
        }

        // The requester must be able to reach the resource inside its own
        // root; the host file is owned by the true root user.
        let service = self.base.service()?;
        let process = service.process().create(req.pid, req.uid, req.gid);
        let mode = if flags == libc::O_WRONLY { W_OK } else { R_OK };
        process.path_access(node.path(), mode)?;

        // Write-only opens become read-write internally so the push loop
        // may read-verify the host value.
        if flags == libc::O_WRONLY {
            node.set_open_flags(libc::O_RDWR);
        }

        node.open().map_err(|_| FsError::host("open failed"))
    }

    fn close(&self, node: &IoNode) -> FsResult<()> {
        node.close().map_err(|_| FsError::host("close failed"))
    }

    fn read(&self, node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize> {
        debug!(target: "shimfs::handler", id = req.id, handler = %self.base.name, "read");

        // A single integer: any non-zero offset is EOF.
        if req.offset > 0 {
            return Ok(0);
        }

        let container = req.require_container()?;
        let name = node.name().to_string();
        let path = node.path().to_string();

        let mut data = match container.data(&path, &name) {
            Some(cached) => cached,
            None => {
                let fetched = self.fetch_file(node)?;
                container.set_data(&path, &name, fetched.clone());
                fetched
            }
        };

        data.push('\n');
        copy_result_buffer(req, data.as_bytes())
    }

    fn write(&self, node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize> {
        debug!(target: "shimfs::handler", id = req.id, handler = %self.base.name, "write");

        let container = req.require_container()?;
        let name = node.name().to_string();
        let path = node.path().to_string();

        let new_max = String::from_utf8_lossy(&req.data).trim().to_string();
        let new_max_int: i64 = new_max
            .parse()
            .map_err(|_| FsError::InvalidArgument(format!("not an integer: {:?}", new_max)))?;

        // The compare-and-update below must be atomic per container, so the
        // whole decision runs under the data-store lock. The push touches
        // only the host, never the helper pipeline.
        container.with_data(|store| {
            let cached = store
                .get(&path)
                .and_then(|names| names.get(&name))
                .cloned();

            match cached {
                None => {
                    self.push_file(node, new_max_int)?;
                }
                Some(current) => {
                    let current_int: i64 = current.parse().map_err(|_| {
                        FsError::InvalidArgument(format!("corrupt cache entry: {:?}", current))
                    })?;
                    // A smaller or equal value only lands in this
                    // container's view; the host keeps the maximum.
                    if new_max_int > current_int {
                        self.push_file(node, new_max_int)?;
                    }
                }
            }

            store
                .entry(path.clone())
                .or_default()
                .insert(name.clone(), new_max.clone());
            Ok::<(), FsError>(())
        })?;

        Ok(req.data.len())
    }

    fn read_dir_all(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<Vec<FileInfo>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testutil::{register_container, service_with_mock};
    use crate::ionode::{IoBackend, MemIo};
    use crate::nsenter::MockNsenterService;
    use std::sync::Arc;

    const PATH: &str = "/proc/sys/net/netfilter/nf_conntrack_max";

    fn write(handler: &Arc<dyn Handler>, service: &Arc<crate::handler::HandlerService>,
             container: &Arc<crate::state::Container>, value: &str) {
        let node = service.io().new_node("nf_conntrack_max", PATH);
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(Arc::clone(container));
        req.data = value.as_bytes().to_vec();
        let n = handler.write(&node, &mut req).unwrap();
        assert_eq!(n, value.len());
    }

    fn read(handler: &Arc<dyn Handler>, service: &Arc<crate::handler::HandlerService>,
            container: &Arc<crate::state::Container>) -> String {
        let node = service.io().new_node("nf_conntrack_max", PATH);
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(Arc::clone(container));
        req.data = vec![0u8; 64];
        let n = handler.read(&node, &mut req).unwrap();
        String::from_utf8_lossy(&req.data[..n]).into_owned()
    }

    #[test]
    fn read_fetches_host_value_then_caches() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "65536");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        let handler = service.lookup_handler(PATH).unwrap();

        assert_eq!(read(&handler, &service, &container), "65536\n");

        // A host change is not observed once cached.
        io.write_file(PATH, b"9").unwrap();
        assert_eq!(read(&handler, &service, &container), "65536\n");
    }

    #[test]
    fn non_integer_host_content_is_invalid() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "not-a-number");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        let handler = service.lookup_handler(PATH).unwrap();

        let node = service.io().new_node("nf_conntrack_max", PATH);
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);
        req.data = vec![0u8; 64];
        assert!(matches!(
            handler.read(&node, &mut req),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn lower_write_updates_cache_without_touching_the_host() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "65536");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        let handler = service.lookup_handler(PATH).unwrap();

        // Prime the cache from the host.
        assert_eq!(read(&handler, &service, &container), "65536\n");

        write(&handler, &service, &container, "1024");
        assert_eq!(read(&handler, &service, &container), "1024\n");
        assert_eq!(io.contents(PATH).as_deref(), Some("65536"));
    }

    #[test]
    fn higher_write_is_pushed_to_the_host() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "65536");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        let handler = service.lookup_handler(PATH).unwrap();

        write(&handler, &service, &container, "100000");
        assert_eq!(read(&handler, &service, &container), "100000\n");
        assert_eq!(io.contents(PATH).as_deref(), Some("100000"));
    }

    #[test]
    fn two_containers_keep_their_own_view_host_keeps_the_max() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "512");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let c1 = register_container(&service, &io, "c1", 1001, 4026540000);
        let c2 = register_container(&service, &io, "c2", 2002, 4026550000);
        let handler = service.lookup_handler(PATH).unwrap();

        write(&handler, &service, &c2, "2048");
        write(&handler, &service, &c1, "1024");

        assert_eq!(read(&handler, &service, &c1), "1024\n");
        assert_eq!(read(&handler, &service, &c2), "2048\n");
        assert_eq!(io.contents(PATH).as_deref(), Some("2048"));
    }

    #[test]
    fn garbage_write_is_einval() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "512");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        let handler = service.lookup_handler(PATH).unwrap();

        let node = service.io().new_node("nf_conntrack_max", PATH);
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);
        req.data = b"banana".to_vec();
        let err = handler.write(&node, &mut req).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn open_accepts_only_plain_read_or_write() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "512");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let handler = service.lookup_handler(PATH).unwrap();

        let mut node = service.io().new_node("nf_conntrack_max", PATH);
        node.set_open_flags(libc::O_RDWR);
        let req = HandlerRequest::new(1001, 0, 0);
        assert!(matches!(
            handler.open(&mut node, &req),
            Err(FsError::AccessDenied)
        ));
    }

    #[test]
    fn write_only_open_is_widened_for_read_verify() {
        let io = Arc::new(MemIo::new());
        io.add_file(PATH, "512");
        // Make the sysctl reachable inside the requester's root.
        io.add_file(
            "/proc/1001/status",
            "Uid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\nGroups:\t\nCapEff:\t0000000000000002\n",
        );
        io.add_file("/proc/1001/root/proc/sys/net/netfilter/nf_conntrack_max", "512");
        io.chmod("/proc/1001/root/proc/sys/net/netfilter/nf_conntrack_max", 0o666);

        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let handler = service.lookup_handler(PATH).unwrap();

        let mut node = service.io().new_node("nf_conntrack_max", PATH);
        node.set_open_flags(libc::O_WRONLY);
        let req = HandlerRequest::new(1001, 0, 0);
        handler.open(&mut node, &req).unwrap();
        assert_eq!(node.open_flags(), libc::O_RDWR);
    }
}
