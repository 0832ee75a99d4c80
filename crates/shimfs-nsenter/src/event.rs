// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Parent side of the helper exchange
//!
//! One transaction: create a socket pair, re-exec the current binary in
//! helper mode with the child end on a fixed descriptor, ship the
//! namespace-path frame and the request frame, read back one response
//! frame, shut the pipe down and reap the helper.

use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tracing::{debug, error};

use shimfs_core::{FsError, FsResult, NsenterService};
use shimfs_proto::{read_frame, validate_exchange, write_frame, NsEvent, NsMessage};

use crate::helper::{HELPER_ARG, INIT_PIPE_ENV, INIT_PIPE_FD};

fn transport(context: &str, err: impl std::fmt::Display) -> FsError {
    error!(target: "shimfs::nsenter", %err, context, "helper transport failure");
    FsError::Transport(format!("{}: {}", context, err))
}

/// Spawns `/proc/self/exe nsenter` per request and speaks the framed
/// protocol with it.
#[derive(Default)]
pub struct NsenterLauncher;

impl NsenterLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl NsenterService for NsenterLauncher {
    fn send_request(&self, event: &mut NsEvent) -> FsResult<()> {
        debug!(
            target: "shimfs::nsenter",
            resource = %event.resource,
            pid = event.pid,
            request = event.request.kind(),
            "launching helper"
        );

        let (parent_fd, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|err| transport("socketpair", err))?;

        let child_raw = child_fd.as_raw_fd();
        let mut command = Command::new("/proc/self/exe");
        command
            .arg(HELPER_ARG)
            .env_clear()
            .env(INIT_PIPE_ENV, INIT_PIPE_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(move || {
                // Park the pipe on the advertised descriptor. dup2 clears
                // close-on-exec; when the fd already sits there, clear the
                // flag by hand.
                if child_raw == INIT_PIPE_FD {
                    let flags = libc::fcntl(child_raw, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(child_raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(child_raw, INIT_PIPE_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|err| transport("spawn helper", err))?;
        drop(child_fd);

        let mut pipe = UnixStream::from(parent_fd);
        let result = Self::exchange(&mut pipe, event);

        let _ = pipe.shutdown(Shutdown::Both);
        match child.wait() {
            Ok(status) if !status.success() && result.is_ok() => {
                return Err(FsError::Transport(format!(
                    "helper exited with {}",
                    status
                )));
            }
            Ok(_) => {}
            Err(err) => {
                if result.is_ok() {
                    return Err(transport("wait for helper", err));
                }
            }
        }

        result
    }
}

impl NsenterLauncher {
    fn exchange(pipe: &mut UnixStream, event: &mut NsEvent) -> FsResult<()> {
        let ns_paths = event.namespace_paths().join(",");
        write_frame(pipe, ns_paths.as_bytes())
            .map_err(|err| transport("send namespace paths", err))?;

        let request =
            serde_json::to_vec(&*event).map_err(|err| FsError::Protocol(err.to_string()))?;
        write_frame(pipe, &request).map_err(|err| transport("send request", err))?;

        let payload = read_frame(pipe).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => transport("read response", "helper closed the pipe"),
            _ => transport("read response", err),
        })?;
        let response: NsMessage =
            serde_json::from_slice(&payload).map_err(|err| FsError::Protocol(err.to_string()))?;

        validate_exchange(&event.request, &response)
            .map_err(|err| FsError::Protocol(err.to_string()))?;

        debug!(
            target: "shimfs::nsenter",
            response = response.kind(),
            "helper answered"
        );
        event.response = Some(response);
        Ok(())
    }
}
