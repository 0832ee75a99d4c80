// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Plain host-directory handler
//!
//! Owns the skeleton paths of the mount (`/`, `/proc`, `/sys`): lookups and
//! listings come straight from the host filesystem, merged with whatever
//! emulated resources hang below the queried directory. No container is
//! required, so these paths also work during container setup.

use std::sync::{Arc, Weak};

use shimfs_proto::{FileInfo, StatData};
use tracing::debug;

use crate::error::FsResult;
use crate::handler::{Handler, HandlerBase, HandlerKind, HandlerRequest, HandlerService};
use crate::ionode::IoNode;

pub struct HostDirHandler {
    base: HandlerBase,
}

impl HostDirHandler {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            base: HandlerBase::new(name, path, HandlerKind::Directory, false),
        }
    }
}

impl Handler for HostDirHandler {
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
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "hostdir lookup");
        node.file_info()
    }

    fn getattr(&self, _node: &IoNode, _req: &HandlerRequest) -> FsResult<Option<StatData>> {
        Ok(None)
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

    fn read(&self, _node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize> {
        if req.offset > 0 {
            return Ok(0);
        }
        Ok(0)
    }

    fn write(&self, _node: &IoNode, _req: &mut HandlerRequest) -> FsResult<usize> {
        Ok(0)
    }

    fn read_dir_all(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Vec<FileInfo>> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "hostdir readdir");

        let entries = node.read_dir()?;
        let service = self.base.service()?;
        Ok(service.merge_emulated(node.path(), req, entries))
    }
}
