// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error taxonomy for shimfs operations
//!
//! Every failure a handler can produce maps onto one of these kinds, and
//! every kind maps onto the errno the FUSE bridge reports to the caller.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    /// The request did not originate from a registered sys container.
    #[error("container not found")]
    ContainerNotFound,
    #[error("container already registered")]
    AlreadyRegistered,
    #[error("container not registered")]
    NotRegistered,
    #[error("no handler registered for {0}")]
    HandlerNotFound(String),
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("permission denied")]
    AccessDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("too many levels of symbolic links")]
    LinkLoop,
    #[error("path name too long")]
    NameTooLong,
    #[error("host i/o: {0}")]
    HostIo(#[from] io::Error),
    /// Failure of the helper pipeline itself (spawn, pipe, decode).
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// An errno observed by the helper inside the target namespaces,
    /// propagated through unchanged.
    #[error("remote errno {code}: {message}")]
    Remote { code: i32, message: String },
    /// A handler outlived the service it was registered with.
    #[error("handler service detached")]
    ServiceDetached,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// The errno the FUSE caller observes for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::ContainerNotFound => libc::EACCES,
            FsError::AlreadyRegistered | FsError::NotRegistered | FsError::NotPermitted => {
                libc::EPERM
            }
            FsError::HandlerNotFound(_) | FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::AccessDenied => libc::EACCES,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::LinkLoop => libc::ELOOP,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::HostIo(_)
            | FsError::Transport(_)
            | FsError::Protocol(_)
            | FsError::ServiceDetached => libc::EIO,
            FsError::Remote { code, .. } => *code,
        }
    }

    /// Wrap a helper-reported errno.
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        FsError::Remote {
            code,
            message: message.into(),
        }
    }

    /// A host-side I/O failure with no underlying `io::Error` to carry.
    pub fn host(message: impl Into<String>) -> Self {
        FsError::HostIo(io::Error::other(message.into()))
    }
}
