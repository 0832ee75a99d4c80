// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! shimfs core — emulation of `/proc` and `/sys` for sys containers
//!
//! The core composes four subsystems: a longest-prefix registry of
//! per-resource handlers, the container state registry, the cross-namespace
//! execution service (trait here, implementation in `shimfs-nsenter`), and
//! a kernel-faithful path-resolution/permission engine. The FUSE bridge in
//! `shimfs-fuse-host` drives everything through [`handler::HandlerService`].

pub mod error;
pub mod handler;
pub mod ionode;
pub mod nsenter;
pub mod process;
pub mod state;

pub use error::{FsError, FsResult};
pub use handler::{Handler, HandlerKind, HandlerRequest, HandlerService};
pub use ionode::{IoBackend, IoNode, IoService, MemIo, NodeStat, RealIo};
pub use nsenter::NsenterService;
pub use process::{Capability, Process, ProcessService, PATH_MAX, R_OK, SYMLINK_MAX, W_OK, X_OK};
pub use state::{Container, ContainerRegistry, ContainerSpec};
