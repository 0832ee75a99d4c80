// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-namespace execution service
//!
//! Handlers that need to act inside a container's namespaces speak to this
//! trait. The process-spawning implementation lives in the `shimfs-nsenter`
//! crate; tests substitute a mock.

use shimfs_proto::{ErrorPayload, FileInfo, NsEvent, NsKind, NsMessage};

use crate::error::{FsError, FsResult};

#[cfg_attr(test, mockall::automock)]
pub trait NsenterService: Send + Sync {
    /// Build a transport event for one helper transaction.
    fn new_event(
        &self,
        resource: &str,
        pid: u32,
        namespaces: &[NsKind],
        request: NsMessage,
    ) -> NsEvent {
        NsEvent::new(resource, pid, namespaces, request)
    }

    /// Launch the helper and run the exchange. On success the event holds
    /// the helper's response message.
    fn send_request(&self, event: &mut NsEvent) -> FsResult<()>;

    /// Consume the response. Yields an error message when the helper never
    /// answered.
    fn receive_response(&self, event: &mut NsEvent) -> NsMessage {
        event.response.take().unwrap_or_else(|| {
            NsMessage::ErrorResponse(ErrorPayload {
                code: libc::EIO,
                message: "no response from helper".to_string(),
            })
        })
    }
}

fn remote_error(payload: ErrorPayload) -> FsError {
    FsError::remote(payload.code, payload.message)
}

pub fn expect_file_info(msg: NsMessage) -> FsResult<FileInfo> {
    match msg {
        NsMessage::LookupResponse(info) => Ok(info),
        NsMessage::ErrorResponse(err) => Err(remote_error(err)),
        other => Err(FsError::Protocol(format!(
            "unexpected {} to a lookup request",
            other.kind()
        ))),
    }
}

pub fn expect_string(msg: NsMessage) -> FsResult<String> {
    match msg {
        NsMessage::ReadFileResponse(data) => Ok(data),
        NsMessage::ErrorResponse(err) => Err(remote_error(err)),
        other => Err(FsError::Protocol(format!(
            "unexpected {} to a read request",
            other.kind()
        ))),
    }
}

pub fn expect_empty(msg: NsMessage) -> FsResult<()> {
    match msg {
        NsMessage::OpenFileResponse | NsMessage::WriteFileResponse => Ok(()),
        NsMessage::ErrorResponse(err) => Err(remote_error(err)),
        other => Err(FsError::Protocol(format!(
            "unexpected {} to an open/write request",
            other.kind()
        ))),
    }
}

pub fn expect_dir_entries(msg: NsMessage) -> FsResult<Vec<FileInfo>> {
    match msg {
        NsMessage::ReadDirResponse(entries) => Ok(entries),
        NsMessage::ErrorResponse(err) => Err(remote_error(err)),
        other => Err(FsError::Protocol(format!(
            "unexpected {} to a readdir request",
            other.kind()
        ))),
    }
}
