// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! shimfs — emulated `/proc` and `/sys` for sys containers
//!
//! Mounts the emulation over the configured root and serves it until
//! unmounted. The same binary doubles as the namespace-enter helper when
//! invoked as `shimfs nsenter`; that mode is dispatched before anything
//! else runs.

mod adapter;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adapter::{ShimFs, DENTRY_CACHE_TIMEOUT_MINS};
use shimfs_core::{ContainerRegistry, HandlerService, IoService, ProcessService};
use shimfs_nsenter::NsenterLauncher;

#[derive(Parser)]
#[command(name = "shimfs", about = "Userspace /proc and /sys emulation for sys containers")]
struct Args {
    /// Mount point served to containers
    #[arg(default_value = "/var/lib/shimfs")]
    mountpoint: PathBuf,

    /// Dentry cache timeout handed to the kernel, in minutes
    #[arg(long, default_value_t = DENTRY_CACHE_TIMEOUT_MINS)]
    dentry_timeout: u64,

    /// Keep serving when a host sysctl push fails
    #[arg(long)]
    ignore_push_errors: bool,
}

fn main() -> Result<()> {
    // Helper mode must win before argument parsing: the parent invokes
    // this very binary with argv[1] = "nsenter".
    if shimfs_nsenter::is_helper_invocation() {
        shimfs_nsenter::helper::run();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    info!(mountpoint = %args.mountpoint.display(), "starting shimfs");

    let io = IoService::real();
    let process = Arc::new(ProcessService::new(io.backend()));
    let state = Arc::new(ContainerRegistry::new(io.backend(), Arc::clone(&process)));
    let service = HandlerService::new(
        io,
        state,
        process,
        Arc::new(NsenterLauncher::new()),
        args.ignore_push_errors,
    );
    service.register_defaults();

    let filesystem = ShimFs::new(service, Duration::from_secs(args.dentry_timeout * 60));

    // allow_other is mandatory: the bridge serves processes owned by
    // container users, not by the daemon's own uid. Permission checks stay
    // with the handlers and the path-access engine, not the kernel.
    let options = vec![
        fuser::MountOption::FSName("shimfs".to_string()),
        fuser::MountOption::Subtype("shimfs".to_string()),
        fuser::MountOption::AllowOther,
    ];

    info!("mounting filesystem");
    fuser::mount2(filesystem, &args.mountpoint, &options)
        .with_context(|| format!("mount at {}", args.mountpoint.display()))?;

    info!("unmounted, shutting down");
    Ok(())
}
