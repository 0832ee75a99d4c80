// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handler for sysctls the kernel namespaces but hides from non-initial
//! user namespaces
//!
//! The IPVS expire sysctls are per-net-namespace already; the kernel merely
//! refuses to show them inside a sys container. This handler exposes them.
//! Writes go straight to the kernel, no cross-container reconciliation.

use std::sync::{Arc, Weak};

use shimfs_proto::{FileInfo, StatData};
use tracing::{debug, error};

use crate::error::{FsError, FsResult};
use crate::handler::{
    copy_result_buffer, Handler, HandlerBase, HandlerKind, HandlerRequest, HandlerService,
};
use crate::ionode::IoNode;
use crate::process::{R_OK, W_OK};

pub struct UsernsHiddenHandler {
    base: HandlerBase,
}

impl UsernsHiddenHandler {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            base: HandlerBase::new(name, path, HandlerKind::UsernsHidden, true),
        }
    }

    fn fetch_file(&self, node: &IoNode) -> FsResult<String> {
        let current = node.read_line().map_err(|err| {
            error!(
                target: "shimfs::handler",
                path = node.path(),
                %err,
                "could not read kernel value"
            );
            FsError::host("sysctl read failed")
        })?;

        if current.parse::<i64>().is_err() {
            return Err(FsError::InvalidArgument(format!(
                "unexpected content in {}: {:?}",
                node.path(),
                current
            )));
        }
        Ok(current)
    }

    fn push_file(&self, node: &IoNode, new_val: i64) -> FsResult<()> {
        node.write_file(new_val.to_string().as_bytes()).map_err(|err| {
            error!(
                target: "shimfs::handler",
                path = node.path(),
                %err,
                "could not write kernel value"
            );
            FsError::host("sysctl write failed")
        })
    }
}

impl Handler for UsernsHiddenHandler {
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
        debug!(target: "shimfs::handler", id = req.id, handler = %self.base.name, "open");

        let flags = node.open_flags();
        if flags != libc::O_RDONLY && flags != libc::O_WRONLY {
            return Err(FsError::AccessDenied);
        }

        let service = self.base.service()?;
        let process = service.process().create(req.pid, req.uid, req.gid);
        let mode = if flags == libc::O_WRONLY { W_OK } else { R_OK };
        process.path_access(node.path(), mode)?;

        // Write-only opens are widened so the handler may read back.
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

        // A single boolean-ish value: non-zero offsets are EOF.
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

        let new_val = String::from_utf8_lossy(&req.data).trim().to_string();
        let new_val_int: i64 = new_val
            .parse()
            .map_err(|_| FsError::InvalidArgument(format!("not an integer: {:?}", new_val)))?;

        // Already namespaced by the kernel: push directly, then remember
        // the container's view.
        self.push_file(node, new_val_int)?;
        container.set_data(&path, &name, new_val);

        Ok(req.data.len())
    }

    fn read_dir_all(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<Vec<FileInfo>> {
        Ok(Vec::new())
    }
}
