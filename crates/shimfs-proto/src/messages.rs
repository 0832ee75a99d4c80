// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request/response message types for the namespace-enter helper
//!
//! Every exchange is one `NsEvent` shipped to the helper followed by one
//! `NsMessage` coming back. Messages are JSON, tagged by `type` so the
//! receiving side can decode the payload without guessing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven namespace kinds a helper may attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NsKind {
    User,
    Pid,
    Mnt,
    Net,
    Ipc,
    Uts,
    Cgroup,
}

impl NsKind {
    pub const ALL: [NsKind; 7] = [
        NsKind::User,
        NsKind::Pid,
        NsKind::Mnt,
        NsKind::Net,
        NsKind::Ipc,
        NsKind::Uts,
        NsKind::Cgroup,
    ];

    /// Every namespace except mount. This is the set handlers use when
    /// forwarding sysctl accesses into a container; the namespace set is a
    /// per-handler constant, not a global default.
    pub const ALL_BUT_MOUNT: [NsKind; 6] = [
        NsKind::User,
        NsKind::Pid,
        NsKind::Net,
        NsKind::Ipc,
        NsKind::Uts,
        NsKind::Cgroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NsKind::User => "user",
            NsKind::Pid => "pid",
            NsKind::Mnt => "mnt",
            NsKind::Net => "net",
            NsKind::Ipc => "ipc",
            NsKind::Uts => "uts",
            NsKind::Cgroup => "cgroup",
        }
    }
}

impl fmt::Display for NsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw stat fields shipped alongside a `FileInfo` so the caller can rebuild
/// uid/gid/inode/permission attributes without another round trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatData {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// File metadata as observed inside the target namespaces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub mod_time: i64,
    pub is_dir: bool,
    pub stat: StatData,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupPayload {
    pub entry: String,
}

/// Open flags and mode travel as ASCII integers; the helper parses them
/// back before issuing the open(2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFilePayload {
    pub file: String,
    pub flags: String,
    pub mode: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFilePayload {
    pub file: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFilePayload {
    pub file: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDirPayload {
    pub dir: String,
}

/// Helper-side failure: the errno observed inside the namespaces plus a
/// human-readable message for the logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

/// One protocol message, request or response, tagged by type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum NsMessage {
    LookupRequest(LookupPayload),
    LookupResponse(FileInfo),
    OpenFileRequest(OpenFilePayload),
    OpenFileResponse,
    ReadFileRequest(ReadFilePayload),
    ReadFileResponse(String),
    WriteFileRequest(WriteFilePayload),
    WriteFileResponse,
    ReadDirRequest(ReadDirPayload),
    ReadDirResponse(Vec<FileInfo>),
    ErrorResponse(ErrorPayload),
}

impl NsMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NsMessage::LookupRequest(_) => "LookupRequest",
            NsMessage::LookupResponse(_) => "LookupResponse",
            NsMessage::OpenFileRequest(_) => "OpenFileRequest",
            NsMessage::OpenFileResponse => "OpenFileResponse",
            NsMessage::ReadFileRequest(_) => "ReadFileRequest",
            NsMessage::ReadFileResponse(_) => "ReadFileResponse",
            NsMessage::WriteFileRequest(_) => "WriteFileRequest",
            NsMessage::WriteFileResponse => "WriteFileResponse",
            NsMessage::ReadDirRequest(_) => "ReadDirRequest",
            NsMessage::ReadDirResponse(_) => "ReadDirResponse",
            NsMessage::ErrorResponse(_) => "ErrorResponse",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, NsMessage::ErrorResponse(_))
    }
}

/// The transport envelope for one helper transaction: the resource being
/// acted on, the target pid, the namespaces to attach to, the request and —
/// once the helper answered — the response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NsEvent {
    pub resource: String,
    pub pid: u32,
    pub namespace: Vec<NsKind>,
    pub request: NsMessage,
    pub response: Option<NsMessage>,
}

impl NsEvent {
    pub fn new(resource: &str, pid: u32, namespace: &[NsKind], request: NsMessage) -> Self {
        Self {
            resource: resource.to_string(),
            pid,
            namespace: namespace.to_vec(),
            request,
            response: None,
        }
    }

    /// Filesystem paths of the namespaces to enter, in attach order.
    /// Format: `kind:/proc/<pid>/ns/<kind>`.
    pub fn namespace_paths(&self) -> Vec<String> {
        self.namespace
            .iter()
            .map(|ns| format!("{}:/proc/{}/ns/{}", ns, self.pid, ns))
            .collect()
    }
}
