// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper side of the exchange
//!
//! Runs as the freshly exec'd `shimfs nsenter` process: read the namespace
//! list from the inherited pipe, attach to each namespace, execute the one
//! requested file operation, answer with a single framed message and exit.
//! Being a new single-threaded process, setns(2) needs no further
//! ceremony here.

use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sched::{setns, CloneFlags};

use shimfs_proto::{
    read_frame, write_frame, ErrorPayload, FileInfo, NsEvent, NsMessage, StatData,
};

/// argv[1] that switches the binary into helper mode.
pub const HELPER_ARG: &str = "nsenter";
/// Environment variable naming the descriptor the pipe arrives on.
pub const INIT_PIPE_ENV: &str = "_LIBCONTAINER_INITPIPE";
/// The descriptor the parent parks the pipe on.
pub const INIT_PIPE_FD: i32 = 3;

/// True when this process was started as the namespace-enter helper.
pub fn is_helper_invocation() -> bool {
    std::env::args().nth(1).as_deref() == Some(HELPER_ARG)
}

/// Run the helper protocol and exit. Never returns.
pub fn run() -> ! {
    let code = match run_inner() {
        Ok(()) => 0,
        Err(_) => 1,
    };
    std::process::exit(code)
}

fn run_inner() -> io::Result<()> {
    let fd: i32 = std::env::var(INIT_PIPE_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing init pipe fd"))?;
    let mut pipe = unsafe { UnixStream::from_raw_fd(fd) };

    // Drop every inherited variable before acting on the request.
    let keys: Vec<_> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in keys {
        std::env::remove_var(key);
    }

    let ns_frame = read_frame(&mut pipe)?;
    enter_namespaces(&ns_frame)?;

    let request_frame = read_frame(&mut pipe)?;
    let event: NsEvent = serde_json::from_slice(&request_frame)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    let response = execute(&event.request);
    let payload = serde_json::to_vec(&response)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(&mut pipe, &payload)
}

/// Attach to each namespace named in the comma-joined `kind:path` list, in
/// order.
fn enter_namespaces(frame: &[u8]) -> io::Result<()> {
    let list = std::str::from_utf8(frame)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if list.is_empty() {
        return Ok(());
    }

    for entry in list.split(',') {
        let (_kind, path) = entry.split_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed namespace entry")
        })?;
        let file = File::open(path)?;
        setns(&file, CloneFlags::empty()).map_err(io::Error::from)?;
    }
    Ok(())
}

/// Perform the requested file operation locally. Failures travel back as an
/// `ErrorResponse` carrying the errno observed here.
fn execute(request: &NsMessage) -> NsMessage {
    match request {
        NsMessage::LookupRequest(payload) => match std::fs::metadata(&payload.entry) {
            Ok(meta) => NsMessage::LookupResponse(file_info(&payload.entry, &meta)),
            Err(err) => error_response(&err),
        },
        NsMessage::OpenFileRequest(payload) => {
            let flags: i32 = match payload.flags.parse() {
                Ok(flags) => flags,
                Err(_) => return protocol_error("open flags are not an integer"),
            };
            let mode: u32 = payload.mode.parse().unwrap_or(0);
            match open_with_flags(&payload.file, flags, mode) {
                Ok(()) => NsMessage::OpenFileResponse,
                Err(err) => error_response(&err),
            }
        }
        NsMessage::ReadFileRequest(payload) => match std::fs::read_to_string(&payload.file) {
            Ok(content) => NsMessage::ReadFileResponse(content.trim().to_string()),
            Err(err) => error_response(&err),
        },
        NsMessage::WriteFileRequest(payload) => {
            match std::fs::write(&payload.file, payload.content.as_bytes()) {
                Ok(()) => NsMessage::WriteFileResponse,
                Err(err) => error_response(&err),
            }
        }
        NsMessage::ReadDirRequest(payload) => match read_dir(&payload.dir) {
            Ok(entries) => NsMessage::ReadDirResponse(entries),
            Err(err) => error_response(&err),
        },
        other => protocol_error(&format!("unsupported request {}", other.kind())),
    }
}

fn open_with_flags(path: &str, flags: i32, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let acc = flags & libc::O_ACCMODE;
    std::fs::OpenOptions::new()
        .read(acc == libc::O_RDONLY || acc == libc::O_RDWR)
        .write(acc == libc::O_WRONLY || acc == libc::O_RDWR)
        .create(flags & libc::O_CREAT != 0)
        .truncate(flags & libc::O_TRUNC != 0)
        .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC))
        .mode(mode)
        .open(path)
        .map(|_| ())
}

fn read_dir(dir: &str) -> io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        entries.push(file_info(&name, &meta));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn file_info(path: &str, meta: &std::fs::Metadata) -> FileInfo {
    use std::os::unix::fs::MetadataExt;
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    FileInfo {
        name,
        size: meta.size() as i64,
        mode: meta.mode(),
        mod_time: meta.mtime(),
        is_dir: meta.is_dir(),
        stat: StatData {
            ino: meta.ino(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        },
    }
}

fn error_response(err: &io::Error) -> NsMessage {
    NsMessage::ErrorResponse(ErrorPayload {
        code: err.raw_os_error().unwrap_or(libc::EIO),
        message: err.to_string(),
    })
}

fn protocol_error(message: &str) -> NsMessage {
    NsMessage::ErrorResponse(ErrorPayload {
        code: libc::EINVAL,
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shimfs_proto::{LookupPayload, OpenFilePayload, ReadDirPayload, ReadFilePayload, WriteFilePayload};

    #[test]
    fn read_file_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_forward");
        std::fs::write(&path, "1\n").unwrap();

        let response = execute(&NsMessage::ReadFileRequest(ReadFilePayload {
            file: path.to_string_lossy().into_owned(),
        }));
        assert_eq!(response, NsMessage::ReadFileResponse("1".to_string()));
    }

    #[test]
    fn missing_file_reports_enoent() {
        let response = execute(&NsMessage::ReadFileRequest(ReadFilePayload {
            file: "/definitely/not/here".to_string(),
        }));
        match response {
            NsMessage::ErrorResponse(err) => assert_eq!(err.code, libc::ENOENT),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn write_then_lookup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("somaxconn");
        let path_str = path.to_string_lossy().into_owned();

        let response = execute(&NsMessage::WriteFileRequest(WriteFilePayload {
            file: path_str.clone(),
            content: "4096".to_string(),
        }));
        assert_eq!(response, NsMessage::WriteFileResponse);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4096");

        let response = execute(&NsMessage::LookupRequest(LookupPayload {
            entry: path_str,
        }));
        match response {
            NsMessage::LookupResponse(info) => {
                assert_eq!(info.name, "somaxconn");
                assert_eq!(info.size, 4);
                assert!(!info.is_dir);
                assert_ne!(info.stat.ino, 0);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn open_parses_ascii_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "0").unwrap();

        let response = execute(&NsMessage::OpenFileRequest(OpenFilePayload {
            file: path.to_string_lossy().into_owned(),
            flags: libc::O_RDONLY.to_string(),
            mode: "0".to_string(),
        }));
        assert_eq!(response, NsMessage::OpenFileResponse);

        let response = execute(&NsMessage::OpenFileRequest(OpenFilePayload {
            file: path.to_string_lossy().into_owned(),
            flags: "not-a-number".to_string(),
            mode: "0".to_string(),
        }));
        match response {
            NsMessage::ErrorResponse(err) => assert_eq!(err.code, libc::EINVAL),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn readdir_lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b"), "2").unwrap();
        std::fs::write(dir.path().join("a"), "1").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let response = execute(&NsMessage::ReadDirRequest(ReadDirPayload {
            dir: dir.path().to_string_lossy().into_owned(),
        }));
        match response {
            NsMessage::ReadDirResponse(entries) => {
                let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
                assert_eq!(names, vec!["a", "b", "sub"]);
                assert!(entries[2].is_dir);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn responses_are_rejected_as_requests() {
        let response = execute(&NsMessage::WriteFileResponse);
        match response {
            NsMessage::ErrorResponse(err) => assert_eq!(err.code, libc::EINVAL),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
