// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Passthrough handler for non-emulated `/proc/sys` resources
//!
//! Default owner of the `/proc/sys` subtree: every access is forwarded into
//! the namespaces of the requesting process and performed on its behalf.
//! Emulated resources below `/proc/sys` are claimed by their own handlers
//! and never reach this one.

use std::sync::{Arc, Weak};

use shimfs_proto::{
    FileInfo, LookupPayload, NsKind, NsMessage, OpenFilePayload, ReadDirPayload, ReadFilePayload,
    StatData, WriteFilePayload,
};
use tracing::debug;

use crate::error::FsResult;
use crate::handler::{
    copy_result_buffer, Handler, HandlerBase, HandlerKind, HandlerRequest, HandlerService,
};
use crate::ionode::IoNode;
use crate::nsenter::{expect_dir_entries, expect_empty, expect_file_info, expect_string};
use crate::process::Process;

pub struct CommonHandler {
    base: HandlerBase,
}

impl CommonHandler {
    pub fn new() -> Self {
        Self {
            base: HandlerBase::new("common", "/proc/sys", HandlerKind::Passthrough, true),
        }
    }

    fn exchange(&self, node: &IoNode, pid: u32, request: NsMessage) -> FsResult<NsMessage> {
        let service = self.base.service()?;
        let nss = service.nsenter();
        let mut event = nss.new_event(node.path(), pid, &NsKind::ALL_BUT_MOUNT, request);
        nss.send_request(&mut event)?;
        Ok(nss.receive_response(&mut event))
    }

    /// Fetch the file content from within the container namespaces.
    fn fetch_file(&self, node: &IoNode, process: &Process) -> FsResult<String> {
        let response = self.exchange(
            node,
            process.pid(),
            NsMessage::ReadFileRequest(ReadFilePayload {
                file: node.path().to_string(),
            }),
        )?;
        expect_string(response)
    }

    /// Write the payload from within the container namespaces.
    fn push_file(&self, node: &IoNode, process: &Process, content: &str) -> FsResult<()> {
        let response = self.exchange(
            node,
            process.pid(),
            NsMessage::WriteFileRequest(WriteFilePayload {
                file: node.path().to_string(),
                content: content.to_string(),
            }),
        )?;
        expect_empty(response)
    }

    /// Caching is only valid when the requester shares the container
    /// init's namespace set; inner containers and unshared namespaces
    /// bypass the cache.
    fn cache_usable(&self, process: &Process, container: &crate::state::Container) -> bool {
        self.base.cacheable && process.shares_namespaces(&container.init_proc())
    }
}

impl Handler for CommonHandler {
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
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common lookup");
        req.require_container()?;

        let response = self.exchange(
            node,
            req.pid,
            NsMessage::LookupRequest(LookupPayload {
                entry: node.path().to_string(),
            }),
        )?;
        expect_file_info(response)
    }

    fn getattr(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Option<StatData>> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common getattr");
        let container = req.require_container()?;

        // Synthesized ownership: the container's root uid/gid, no probe of
        // the container itself.
        Ok(Some(StatData {
            uid: container.uid(),
            gid: container.gid(),
            ..Default::default()
        }))
    }

    fn setattr(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<()> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common setattr");
        req.require_container()?;

        // Truncation and friends are carried by an open with the node's
        // current flags inside the container.
        let response = self.exchange(
            node,
            req.pid,
            NsMessage::OpenFileRequest(OpenFilePayload {
                file: node.path().to_string(),
                flags: node.open_flags().to_string(),
                mode: node.open_mode().to_string(),
            }),
        )?;
        expect_empty(response)
    }

    fn open(&self, node: &mut IoNode, req: &HandlerRequest) -> FsResult<()> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common open");
        req.require_container()?;

        let response = self.exchange(
            node,
            req.pid,
            NsMessage::OpenFileRequest(OpenFilePayload {
                file: node.path().to_string(),
                flags: node.open_flags().to_string(),
                mode: node.open_mode().to_string(),
            }),
        )?;
        expect_empty(response)
    }

    fn close(&self, _node: &IoNode) -> FsResult<()> {
        Ok(())
    }

    fn read(&self, node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common read");

        if req.offset > 0 {
            return Ok(0);
        }

        let container = req.require_container()?;
        let service = self.base.service()?;
        let process = service.process().create(req.pid, req.uid, req.gid);

        let name = node.name().to_string();
        let path = node.path().to_string();

        let mut data = if self.cache_usable(&process, &container) {
            match container.data(&path, &name) {
                Some(cached) => cached,
                None => {
                    // The store lock is never held across the helper round
                    // trip; fetch first, publish after.
                    let fetched = self.fetch_file(node, &process)?;
                    container.set_data(&path, &name, fetched.clone());
                    fetched
                }
            }
        } else {
            self.fetch_file(node, &process)?
        };

        data.push('\n');
        copy_result_buffer(req, data.as_bytes())
    }

    fn write(&self, node: &IoNode, req: &mut HandlerRequest) -> FsResult<usize> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common write");

        let container = req.require_container()?;
        let service = self.base.service()?;
        let process = service.process().create(req.pid, req.uid, req.gid);

        let name = node.name().to_string();
        let path = node.path().to_string();
        let content = String::from_utf8_lossy(&req.data)
            .trim_end()
            .to_string();

        self.push_file(node, &process, &content)?;
        if self.cache_usable(&process, &container) {
            container.set_data(&path, &name, content);
        }

        Ok(req.data.len())
    }

    fn read_dir_all(&self, node: &IoNode, req: &HandlerRequest) -> FsResult<Vec<FileInfo>> {
        debug!(target: "shimfs::handler", id = req.id, path = node.path(), "common readdir");
        req.require_container()?;

        let response = self.exchange(
            node,
            req.pid,
            NsMessage::ReadDirRequest(ReadDirPayload {
                dir: node.path().to_string(),
            }),
        )?;
        let entries = expect_dir_entries(response)?;

        let service = self.base.service()?;
        Ok(service.merge_emulated(node.path(), req, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::handler::testutil::{register_container, seed_ns, service_with_mock};
    use crate::ionode::MemIo;
    use crate::nsenter::MockNsenterService;
    use shimfs_proto::{ErrorPayload, NsEvent};
    use std::sync::Arc;

    fn passthrough_event_builder(mock: &mut MockNsenterService) {
        mock.expect_new_event()
            .returning(|resource, pid, ns, req| NsEvent::new(resource, pid, ns, req));
        mock.expect_receive_response()
            .returning(|event| event.response.take().expect("response staged"));
    }

    #[test]
    fn read_without_container_is_denied() {
        let io = Arc::new(MemIo::new());
        let service = service_with_mock(Arc::clone(&io), MockNsenterService::new());

        let handler = service.lookup_handler("/proc/sys/net/ipv4/ip_forward").unwrap();
        let node = service
            .io()
            .new_node("ip_forward", "/proc/sys/net/ipv4/ip_forward");
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.data = vec![0u8; 32];

        let err = handler.read(&node, &mut req).unwrap_err();
        assert!(matches!(err, FsError::ContainerNotFound));
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn read_caches_and_appends_newline() {
        let io = Arc::new(MemIo::new());

        let mut mock = MockNsenterService::new();
        passthrough_event_builder(&mut mock);
        // Exactly one helper round trip: the second read is served from
        // the container cache.
        mock.expect_send_request().times(1).returning(|event| {
            event.response = Some(NsMessage::ReadFileResponse("1".to_string()));
            Ok(())
        });

        let service = service_with_mock(Arc::clone(&io), mock);
        let container = register_container(&service, &io, "c1", 1001, 4026540000);

        // The requester shares the init namespaces.
        seed_ns(&io, 1005, 4026540000);

        let handler = service.lookup_handler("/proc/sys/net/ipv4/ip_forward").unwrap();
        let node = service
            .io()
            .new_node("ip_forward", "/proc/sys/net/ipv4/ip_forward");

        for _ in 0..2 {
            let mut req = HandlerRequest::new(1005, 0, 0);
            req.container = Some(Arc::clone(&container));
            req.data = vec![0u8; 32];
            let n = handler.read(&node, &mut req).unwrap();
            assert_eq!(&req.data[..n], b"1\n");
        }

        assert_eq!(
            container
                .data("/proc/sys/net/ipv4/ip_forward", "ip_forward")
                .as_deref(),
            Some("1")
        );
    }

    #[test]
    fn caller_outside_init_namespaces_bypasses_the_cache() {
        let io = Arc::new(MemIo::new());

        let mut mock = MockNsenterService::new();
        passthrough_event_builder(&mut mock);
        // Both reads go to the helper: nothing may be cached for a caller
        // in foreign namespaces.
        mock.expect_send_request().times(2).returning(|event| {
            event.response = Some(NsMessage::ReadFileResponse("0".to_string()));
            Ok(())
        });

        let service = service_with_mock(Arc::clone(&io), mock);
        let container = register_container(&service, &io, "c1", 1001, 4026540000);

        // Same user ns, different net ns (an unshared inner namespace).
        for kind in shimfs_proto::NsKind::ALL {
            let inode = match kind {
                shimfs_proto::NsKind::Net => 999,
                shimfs_proto::NsKind::User => 4026540000,
                other => 4026540000 + other as u64 + 1,
            };
            io.add_ns_inode(1006, kind, inode);
        }

        let handler = service.lookup_handler("/proc/sys/net/ipv4/ip_forward").unwrap();
        let node = service
            .io()
            .new_node("ip_forward", "/proc/sys/net/ipv4/ip_forward");

        for _ in 0..2 {
            let mut req = HandlerRequest::new(1006, 0, 0);
            req.container = Some(Arc::clone(&container));
            req.data = vec![0u8; 32];
            handler.read(&node, &mut req).unwrap();
        }

        assert!(container
            .data("/proc/sys/net/ipv4/ip_forward", "ip_forward")
            .is_none());
    }

    #[test]
    fn write_trims_and_read_returns_trimmed_plus_newline() {
        let io = Arc::new(MemIo::new());

        let mut mock = MockNsenterService::new();
        passthrough_event_builder(&mut mock);
        mock.expect_send_request().times(1).returning(|event| {
            match &event.request {
                NsMessage::WriteFileRequest(payload) => {
                    // The payload arrives already trimmed.
                    assert_eq!(payload.content, "1");
                    event.response = Some(NsMessage::WriteFileResponse);
                }
                other => panic!("unexpected request {:?}", other),
            }
            Ok(())
        });

        let service = service_with_mock(Arc::clone(&io), mock);
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        seed_ns(&io, 1005, 4026540000);

        let handler = service.lookup_handler("/proc/sys/net/ipv4/ip_forward").unwrap();
        let node = service
            .io()
            .new_node("ip_forward", "/proc/sys/net/ipv4/ip_forward");

        let mut req = HandlerRequest::new(1005, 0, 0);
        req.container = Some(Arc::clone(&container));
        req.data = b"1 \n".to_vec();
        let n = handler.write(&node, &mut req).unwrap();
        assert_eq!(n, 3);

        // A read from the same namespaces is served from the cache, with
        // the trailing newline appended.
        let mut req = HandlerRequest::new(1005, 0, 0);
        req.container = Some(Arc::clone(&container));
        req.data = vec![0u8; 32];
        let n = handler.read(&node, &mut req).unwrap();
        assert_eq!(&req.data[..n], b"1\n");
    }

    #[test]
    fn helper_errno_propagates_to_the_caller() {
        let io = Arc::new(MemIo::new());

        let mut mock = MockNsenterService::new();
        passthrough_event_builder(&mut mock);
        mock.expect_send_request().returning(|event| {
            event.response = Some(NsMessage::ErrorResponse(ErrorPayload {
                code: libc::EACCES,
                message: "permission denied".to_string(),
            }));
            Ok(())
        });

        let service = service_with_mock(Arc::clone(&io), mock);
        let container = register_container(&service, &io, "c1", 1001, 4026540000);

        let handler = service.lookup_handler("/proc/sys/kernel/cap_last_cap").unwrap();
        let mut node = service
            .io()
            .new_node("cap_last_cap", "/proc/sys/kernel/cap_last_cap");
        node.set_open_flags(libc::O_RDONLY);

        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);
        let err = handler.open(&mut node, &req).unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn readdir_merges_helper_and_emulated_entries() {
        let io = Arc::new(MemIo::new());

        let mut mock = MockNsenterService::new();
        passthrough_event_builder(&mut mock);
        mock.expect_send_request().returning(|event| {
            event.response = Some(NsMessage::ReadDirResponse(vec![
                FileInfo {
                    name: "file-max".to_string(),
                    mode: libc::S_IFREG | 0o644,
                    ..Default::default()
                },
                FileInfo {
                    name: "inotify".to_string(),
                    mode: libc::S_IFDIR | 0o555,
                    is_dir: true,
                    ..Default::default()
                },
            ]));
            Ok(())
        });

        let service = service_with_mock(Arc::clone(&io), mock);
        let container = register_container(&service, &io, "c1", 1001, 4026540000);
        // Host-side stat target for the emulated file-max lookup.
        io.add_file("/proc/sys/fs/file-max", "65536");

        let handler = service.lookup_handler("/proc/sys/fs").unwrap();
        let node = service.io().new_node("fs", "/proc/sys/fs");
        let mut req = HandlerRequest::new(1001, 0, 0);
        req.container = Some(container);

        let entries = handler.read_dir_all(&node, &req).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        // The helper listing and the emulated children are merged; file-max
        // appears once.
        assert!(names.contains(&"file-max"));
        assert!(names.contains(&"inotify"));
        assert!(names.contains(&"binfmt_misc"));
        assert_eq!(names.iter().filter(|n| **n == "file-max").count(), 1);
    }
}
