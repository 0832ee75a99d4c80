// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process descriptors and kernel-faithful path resolution
//!
//! A [`Process`] mirrors what the kernel knows about a pid: credentials and
//! capabilities from `/proc/<pid>/status`, root/cwd anchors, and the inodes
//! of its seven namespaces. [`Process::path_access`] re-implements
//! path_resolution(7) over those anchors, including symlink following with
//! the kernel's loop bound and DAC checks honouring `CAP_DAC_OVERRIDE` and
//! `CAP_DAC_READ_SEARCH`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shimfs_proto::NsKind;

use crate::error::{FsError, FsResult};
use crate::ionode::{clean_join, parent_dir, IoBackend};

pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;

/// Symlink recursion bound, as the kernel applies it.
pub const SYMLINK_MAX: usize = 40;
pub const PATH_MAX: usize = 4096;

/// The two capabilities the DAC engine honours, by their kernel bit number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    DacOverride = 1,
    DacReadSearch = 2,
}

/// Credentials parsed from `/proc/<pid>/status`.
#[derive(Clone, Debug, Default)]
struct Identity {
    uid: u32,
    gid: u32,
    sgid: Vec<u32>,
    cap_eff: u64,
}

impl Identity {
    fn is_capable(&self, cap: Capability) -> bool {
        self.cap_eff >> (cap as u64) & 1 == 1
    }
}

pub struct ProcessService {
    io: Arc<dyn IoBackend>,
}

impl ProcessService {
    pub fn new(io: Arc<dyn IoBackend>) -> Self {
        Self { io }
    }

    pub fn create(&self, pid: u32, uid: u32, gid: u32) -> Process {
        Process {
            pid,
            uid,
            gid,
            root: format!("/proc/{}/root", pid),
            cwd: format!("/proc/{}/cwd", pid),
            identity: Mutex::new(None),
            ns_inodes: Mutex::new(None),
            io: Arc::clone(&self.io),
        }
    }
}

pub struct Process {
    pid: u32,
    uid: u32,
    gid: u32,
    root: String,
    cwd: String,
    identity: Mutex<Option<Identity>>,
    ns_inodes: Mutex<Option<HashMap<NsKind, u64>>>,
    io: Arc<dyn IoBackend>,
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Namespace inodes for all seven kinds, loaded once per descriptor.
    pub fn ns_inodes(&self) -> FsResult<HashMap<NsKind, u64>> {
        let mut cached = self.ns_inodes.lock().unwrap();
        if let Some(inodes) = cached.as_ref() {
            return Ok(inodes.clone());
        }
        let mut inodes = HashMap::new();
        for kind in NsKind::ALL {
            inodes.insert(kind, self.io.ns_inode(self.pid, kind)?);
        }
        *cached = Some(inodes.clone());
        Ok(inodes)
    }

    pub fn ns_inode(&self, kind: NsKind) -> FsResult<u64> {
        self.ns_inodes()?
            .get(&kind)
            .copied()
            .ok_or_else(|| FsError::InvalidArgument(format!("no {} namespace inode", kind)))
    }

    /// User-namespace inode, or zero when it cannot be determined.
    pub fn user_ns_inode(&self) -> u64 {
        self.ns_inode(NsKind::User).unwrap_or(0)
    }

    /// True when both processes live in the same pid, user and net
    /// namespaces. This is the condition under which per-container caching
    /// is valid.
    pub fn shares_namespaces(&self, other: &Process) -> bool {
        let (mine, theirs) = match (self.ns_inodes(), other.ns_inodes()) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return false,
        };
        [NsKind::Pid, NsKind::User, NsKind::Net]
            .iter()
            .all(|kind| mine.get(kind) == theirs.get(kind))
    }

    pub fn is_capable(&self, cap: Capability) -> bool {
        match self.load_identity() {
            Ok(identity) => identity.is_capable(cap),
            Err(_) => false,
        }
    }

    /// Emulates the path resolution and permission checking the kernel
    /// performs per path_resolution(7), for this process.
    ///
    /// Absolute paths resolve from the process root, relative ones from its
    /// cwd; `..` never escapes the root; symlinks are followed up to
    /// [`SYMLINK_MAX`] times. The final component is checked against `mode`
    /// (a mask of [`R_OK`]/[`W_OK`]/[`X_OK`]), every other component against
    /// `X_OK`.
    pub fn path_access(&self, path: &str, mode: u32) -> FsResult<()> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        if path.len() + 1 > PATH_MAX {
            return Err(FsError::NameTooLong);
        }

        let identity = self.load_identity()?;

        let start = if path.starts_with('/') {
            self.root.clone()
        } else {
            self.cwd.clone()
        };

        let components: Vec<&str> = path.split('/').collect();
        let mut cur = start;
        let mut link_cnt = 0usize;

        for (i, component) in components.iter().enumerate() {
            let final_seg = i == components.len() - 1;

            if component.is_empty() {
                continue;
            }

            if *component == ".." {
                let parent = parent_dir(&cur);
                cur = if parent.starts_with(&self.root) {
                    parent
                } else {
                    self.root.clone()
                };
            } else if *component != "." {
                cur = clean_join(&cur, component);
            }

            let st = self.io.lstat(&cur).map_err(|_| FsError::NotFound)?;
            let mut is_symlink = st.is_symlink();
            let mut is_dir = st.is_dir();

            if !final_seg && !is_symlink && !is_dir {
                return Err(FsError::NotADirectory);
            }

            // Follow the symlink chain, unless the component is the process
            // root itself: the root is the anchor and must never be
            // dereferenced, or it would lead out to the host "/".
            if is_symlink && cur != self.root {
                loop {
                    if link_cnt >= SYMLINK_MAX {
                        return Err(FsError::LinkLoop);
                    }

                    let link = self.io.read_link(&cur).map_err(|_| FsError::NotFound)?;
                    cur = if link.starts_with('/') {
                        clean_join(&self.root, &link)
                    } else {
                        clean_join(&parent_dir(&cur), &link)
                    };

                    if cur == self.root {
                        is_dir = true;
                        break;
                    }

                    let st = self.io.lstat(&cur).map_err(|_| FsError::NotFound)?;
                    is_symlink = st.is_symlink();
                    is_dir = st.is_dir();
                    if !is_symlink {
                        break;
                    }
                    link_cnt += 1;
                }

                if !final_seg && !is_dir {
                    return Err(FsError::NotADirectory);
                }
            }

            let want = if final_seg { mode } else { X_OK };
            match self.check_perm(&identity, &cur, want) {
                Ok(true) => {}
                _ => return Err(FsError::AccessDenied),
            }
        }

        Ok(())
    }

    /// DAC check on a single, already-resolved path. Check order mirrors
    /// the kernel: owner class, then group (primary or supplementary), then
    /// other, then the capability overrides.
    fn check_perm(&self, identity: &Identity, path: &str, mode: u32) -> FsResult<bool> {
        let st = self.io.stat(path)?;
        let fperm = st.perm();

        if st.uid == identity.uid {
            let class = (fperm & 0o700) >> 6;
            if mode & class == mode {
                return Ok(true);
            }
        }

        if st.gid == identity.gid || identity.sgid.contains(&st.gid) {
            let class = (fperm & 0o070) >> 3;
            if mode & class == mode {
                return Ok(true);
            }
        }

        let class = fperm & 0o007;
        if mode & class == mode {
            return Ok(true);
        }

        if identity.is_capable(Capability::DacOverride) {
            // CAP_DAC_OVERRIDE bypasses read/write checks on any file and
            // directory checks entirely; execute on a regular file still
            // requires at least one execute bit.
            if st.is_dir() {
                return Ok(true);
            }
            if mode & X_OK != X_OK {
                return Ok(true);
            }
            if fperm & 0o111 != 0 {
                return Ok(true);
            }
        }

        if identity.is_capable(Capability::DacReadSearch) {
            if st.is_dir() && mode & W_OK != W_OK {
                return Ok(true);
            }
            if !st.is_dir() && mode == R_OK {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn load_identity(&self) -> FsResult<Identity> {
        let mut cached = self.identity.lock().unwrap();
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let status = self.read_status(&["Uid", "Gid", "Groups", "CapEff"])?;

        let uid = parse_cred_line(status.get("Uid"), "Uid")?;
        let gid = parse_cred_line(status.get("Gid"), "Gid")?;

        let mut sgid = Vec::new();
        if let Some(groups) = status.get("Groups") {
            for field in groups.split_whitespace() {
                let gid: u32 = field
                    .parse()
                    .map_err(|_| FsError::InvalidArgument(format!("bad group id {:?}", field)))?;
                sgid.push(gid);
            }
        }

        let cap_eff = match status.get("CapEff") {
            Some(hex) => u64::from_str_radix(hex.trim(), 16)
                .map_err(|_| FsError::InvalidArgument(format!("bad CapEff {:?}", hex)))?,
            None => 0,
        };

        let identity = Identity {
            uid,
            gid,
            sgid,
            cap_eff,
        };
        *cached = Some(identity.clone());
        Ok(identity)
    }

    fn read_status(&self, fields: &[&str]) -> FsResult<HashMap<String, String>> {
        let path = format!("/proc/{}/status", self.pid);
        let content = self.io.read_to_string(&path)?;

        let mut status = HashMap::new();
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                if fields.contains(&key) {
                    status.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        Ok(status)
    }
}

/// Parse a `Uid:`/`Gid:` status line and return the effective id. The line
/// must carry exactly four ids (real, effective, saved, filesystem).
fn parse_cred_line(line: Option<&String>, field: &str) -> FsResult<u32> {
    let line = line.ok_or_else(|| FsError::InvalidArgument(format!("missing {} status", field)))?;
    let ids: Vec<&str> = line.split_whitespace().collect();
    if ids.len() != 4 {
        return Err(FsError::InvalidArgument(format!(
            "invalid {} status: {:?}",
            field, ids
        )));
    }
    ids[1]
        .parse()
        .map_err(|_| FsError::InvalidArgument(format!("invalid {} status: {:?}", field, ids)))
}
