// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `/proc/sys/fs/binfmt_misc/status` handler

use std::sync::{Arc, Weak};

use shimfs_proto::{FileInfo, StatData};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::handler::{Handler, HandlerBase, HandlerKind, HandlerRequest, HandlerService};
use crate::ionode::IoNode;

pub struct BinfmtStatusHandler {
    base: HandlerBase,
}

impl BinfmtStatusHandler {
    pub fn new() -> Self {
        Self {
            base: HandlerBase::new(
                "binfmtStatus",
                "/proc/sys/fs/binfmt_misc/status",
                HandlerKind::Synthetic,
                false,
            ),
        }
    }
}

impl Handler for BinfmtStatusHandler {
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

    fn lookup(&self, _node: &IoNode, req: &HandlerRequest) -> FsResult<FileInfo> {
        debug!(target: "shimfs::handler", id = req.id, "binfmt status lookup");
        Err(FsError::NotFound)
    }

    fn getattr(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Option<StatData>> {
        debug!(target: "shimfs::handler", id = req.id, "binfmt status getattr");

        let service = self.base.service()?;
        let userns_inode = service.find_user_ns_inode(req.pid);
        if userns_inode == 0 {
            return Err(FsError::NotFound);
        }

        // Accesses from the initial user namespace happen while the
        // container is still being set up; answer as true root.
        if userns_inode == service.host_user_ns_inode() {
            return Ok(Some(StatData {
                uid: 0,
                gid: 0,
                ..Default::default()
            }));
        }

        let common = service
            .find_handler("common")
            .ok_or_else(|| FsError::HandlerNotFound("common".to_string()))?;
        common.getattr(node, req)
    }

    fn setattr(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<()> {
        Ok(())
    }

    fn open(&self, _node: &mut IoNode, _req: &HandlerRequest) -> FsResult<()> {
        Ok(())
    }

    fn close(&self, _node: &IoNode) -> FsResult<()> {
        Ok(())
    }

    fn read(&self, _node: &IoNode, _req: &mut HandlerRequest) -> FsResult<usize> {
        Ok(0)
    }

    fn write(&self, _node: &IoNode, _req: &mut HandlerRequest) -> FsResult<usize> {
        Ok(0)
    }

    fn read_dir_all(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<Vec<FileInfo>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testutil::{register_container, seed_ns, service_with_mock};
    use crate::ionode::MemIo;
    use crate::nsenter::MockNsenterService;
    use std::sync::Arc;

    const PATH: &str = "/proc/sys/fs/binfmt_misc/status";

    #[test]
    fn initial_userns_caller_sees_root_ownership() {
        let io = Arc::new(MemIo::new());
        // The service reads its own user-ns inode at construction.
        io.add_ns_inode(std::process::id(), shimfs_proto::NsKind::User, 4026531837);
        // The requesting pid sits in the same (initial) user namespace.
        seed_ns(&io, 777, 4026531837);

        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let handler = service.lookup_handler(PATH).unwrap();

        let node = service.io().new_node("status", PATH);
        let req = HandlerRequest::new(777, 0, 0);
        let stat = handler.getattr(&node, &req).unwrap().unwrap();
        assert_eq!((stat.uid, stat.gid), (0, 0));
    }

    #[test]
    fn container_caller_is_deferred_to_the_common_handler() {
        let io = Arc::new(MemIo::new());
        io.add_ns_inode(std::process::id(), shimfs_proto::NsKind::User, 4026531837);

        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        let handler = service.lookup_handler(PATH).unwrap();

        let node = service.io().new_node("status", PATH);
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);
        let stat = handler.getattr(&node, &req).unwrap().unwrap();
        // The common handler answers with the container's id-mapping root.
        assert_eq!((stat.uid, stat.gid), (231072, 231072));
    }

    #[test]
    fn lookup_is_hidden() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let handler = service.lookup_handler(PATH).unwrap();

        let node = service.io().new_node("status", PATH);
        let req = HandlerRequest::new(1001, 0, 0);
        let err = handler.lookup(&node, &req).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
