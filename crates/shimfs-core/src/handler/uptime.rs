// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `/proc/uptime` handler
//!
//! A sys container's uptime is the time since its registration, not the
//! host's. Both columns carry the same value; the idle column is an
//! approximation.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use shimfs_proto::{FileInfo, StatData};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::handler::{
    copy_result_buffer, Handler, HandlerBase, HandlerKind, HandlerRequest, HandlerService,
};
use crate::ionode::IoNode;

pub struct UptimeHandler {
    base: HandlerBase,
}

impl UptimeHandler {
    pub fn new() -> Self {
        Self {
            base: HandlerBase::new("procUptime", "/proc/uptime", HandlerKind::Synthetic, false),
        }
    }
}

impl Handler for UptimeHandler {
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
        debug!(target: "shimfs::handler", id = req.id, "uptime lookup");
        node.file_info()
    }

    fn getattr(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Option<StatData>> {
        let service = self.base.service()?;
        let common = service
            .find_handler("common")
            .ok_or_else(|| FsError::HandlerNotFound("common".to_string()))?;
        common.getattr(node, req)
    }

    fn setattr(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<()> {
        Ok(())
    }

    fn open(&self, node: &mut IoNode, req: &HandlerRequest) -> FsResult<()> {
        debug!(target: "shimfs::handler", id = req.id, "uptime open");

        if node.open_flags() != libc::O_RDONLY {
            return Err(FsError::AccessDenied);
        }
        node.open().map_err(|_| FsError::host("open failed"))
    }

    fn close(&self, _node: &IoNode) -> FsResult<()> {
        Ok(())
    }

    fn read(&self, _node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize> {
        debug!(target: "shimfs::handler", id = req.id, "uptime read");

        if req.offset > 0 {
            return Ok(0);
        }

        let container = req.require_container()?;

        // By the time anything reads /proc/uptime the container has been
        // fully registered, so ctime is set.
        let ctime = container.ctime().ok_or(FsError::ContainerNotFound)?;
        let uptime = SystemTime::now()
            .duration_since(ctime)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let data = format!("{} {}\n", uptime, uptime);
        copy_result_buffer(req, data.as_bytes())
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
    use crate::handler::testutil::{register_container, service_with_mock};
    use crate::ionode::MemIo;
    use crate::nsenter::MockNsenterService;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn uptime_counts_from_registration() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);

        // Pretend the container registered 123 seconds ago.
        container.set_ctime(SystemTime::now() - Duration::from_secs(123));

        let handler = service.lookup_handler("/proc/uptime").unwrap();
        let node = service.io().new_node("uptime", "/proc/uptime");
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);
        req.data = vec![0u8; 64];

        let n = handler.read(&node, &mut req).unwrap();
        assert_eq!(&req.data[..n], b"123 123\n");
    }

    #[test]
    fn offset_reads_are_eof() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let container = register_container(&service, &io, "c1", 1001, 4026540000);

        let handler = service.lookup_handler("/proc/uptime").unwrap();
        let node = service.io().new_node("uptime", "/proc/uptime");
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);
        req.offset = 8;
        req.data = vec![0u8; 64];
        assert_eq!(handler.read(&node, &mut req).unwrap(), 0);
    }

    #[test]
    fn only_read_only_opens_are_allowed() {
        let io = Arc::new(MemIo::new());
        io.add_file("/proc/uptime", "1 1");
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());
        let handler = service.lookup_handler("/proc/uptime").unwrap();

        let mut node = service.io().new_node("uptime", "/proc/uptime");
        node.set_open_flags(libc::O_WRONLY);
        let req = HandlerRequest::new(1001, 0, 0);
        assert!(matches!(
            handler.open(&mut node, &req),
            Err(FsError::AccessDenied)
        ));

        node.set_open_flags(libc::O_RDONLY);
        handler.open(&mut node, &req).unwrap();
    }
}
